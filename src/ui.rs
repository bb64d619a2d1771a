//! Interface de terminal do keyswarm: spinners e saída colorida.
//!
//! Usa as crates `indicatif` para o spinner de progresso e `console` para
//! estilização com cores. O [`MissionProgress`] acompanha visualmente
//! uma missão no terminal.

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::breaker::BreakerStatus;
use crate::orchestrator::{MissionEnd, MissionReport, MissionStatus};
use crate::pool::{CredentialSnapshot, CredentialStatus};
use crate::stop::StopReason;

/// Indicador visual de progresso de uma missão.
///
/// O spinner mostra contadores ao vivo; LOCKDOWN aparece em vermelho.
pub struct MissionProgress {
    pb: ProgressBar,
    green: Style,
    red: Style,
    yellow: Style,
}

impl MissionProgress {
    /// Inicia o spinner com uma mensagem inicial.
    pub fn start(message: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        // O template é constante; se falhar, o spinner padrão serve.
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
            pb.set_style(style);
        }
        pb.set_message(message.to_string());
        pb.enable_steady_tick(std::time::Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
        }
    }

    /// Atualiza a mensagem do spinner com o status da missão.
    pub fn update(&self, status: &MissionStatus) {
        let breaker = match status.breaker.status {
            BreakerStatus::Healthy => self.green.apply_to("HEALTHY").to_string(),
            BreakerStatus::Lockdown => self.red.apply_to("LOCKDOWN").to_string(),
        };
        let live = status
            .credentials
            .iter()
            .filter(|c| c.status != CredentialStatus::Dead)
            .count();
        self.pb.set_message(format!(
            "{breaker} | done {} | abandoned {} | retries {} | in flight {} | keys {live}/{}",
            status.done,
            status.abandoned,
            status.retries,
            status.ledger.claimed.len(),
            status.credentials.len(),
        ));
    }

    /// Imprime uma linha acima do spinner sem interrompê-lo.
    pub fn note(&self, message: &str) {
        self.pb
            .println(format!("  {} {message}", self.yellow.apply_to("↻")));
    }

    /// Finaliza o spinner e exibe o resumo da missão.
    pub fn complete(&self, report: &MissionReport) {
        self.pb.finish_and_clear();
        let summary = format!(
            "{} done, {} abandoned, {} interrupted",
            report.done(),
            report.abandoned(),
            report.interrupted()
        );
        match &report.outcome {
            MissionEnd::Drained => {
                println!("  {} Mission drained the backlog: {summary}", self.green.apply_to("✓"));
            }
            MissionEnd::Stopped(StopReason::Manual) => {
                println!("  {} Mission stopped: {summary}", self.yellow.apply_to("■"));
            }
            MissionEnd::Stopped(StopReason::SystemicOutage(reason)) => {
                println!(
                    "  {} Mission halted by systemic outage ({reason}): {summary}",
                    self.red.apply_to("✗")
                );
            }
        }
    }

    /// Imprime o relatório da missão formatado em JSON.
    pub fn print_report(&self, report: &MissionReport) {
        let style = match report.outcome {
            MissionEnd::Drained => &self.green,
            MissionEnd::Stopped(StopReason::Manual) => &self.yellow,
            MissionEnd::Stopped(StopReason::SystemicOutage(_)) => &self.red,
        };
        println!();
        println!("{}", style.apply_to("─── Mission Report ───"));
        println!(
            "{}",
            serde_json::to_string_pretty(report).unwrap_or_default()
        );
    }
}

/// Imprime uma linha por chave, sem revelar o segredo.
pub fn print_credentials(credentials: &[CredentialSnapshot]) {
    for c in credentials {
        let style = match c.status {
            CredentialStatus::Active => Style::new().green(),
            CredentialStatus::RateLimited => Style::new().yellow(),
            CredentialStatus::Dead => Style::new().red(),
        };
        println!(
            "  {:<20} {} (failures: {})",
            c.label,
            style.apply_to(c.status),
            c.consecutive_failures
        );
    }
}
