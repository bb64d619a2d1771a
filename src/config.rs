//! Configuração do keyswarm carregada a partir de `keyswarm.toml`.
//!
//! A struct [`KeyswarmConfig`] contém todos os parâmetros configuráveis.
//! Valores não presentes no arquivo usam defaults sensíveis.
//! As variáveis de ambiente `ANTHROPIC_API_KEYS` (lista separada por vírgulas)
//! e `ANTHROPIC_API_KEY` têm precedência sobre o arquivo.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::KeyswarmError;
use crate::orchestrator::MissionConfig;
use crate::pool::PoolPolicy;
use crate::state_machine::EscalationSchedule;

/// Arquivo lido por [`KeyswarmConfig::load`].
pub const CONFIG_FILE: &str = "keyswarm.toml";

/// Configuração de nível superior carregada de `keyswarm.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeyswarmConfig {
    /// Chaves da API Anthropic que formam o pool.
    #[serde(default)]
    pub api_keys: Vec<String>,

    /// Modelo usado para gerar as saídas.
    #[serde(default = "default_model")]
    pub model: String,

    /// Modelo barato usado pela sonda de recuperação e pelo comando `probe`.
    #[serde(default = "default_probe_model")]
    pub probe_model: String,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Número de workers concorrentes.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Tamanho base da página de candidatos.
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Limite de cada tentativa individual, em segundos.
    #[serde(default = "default_attempt_timeout_secs")]
    pub attempt_timeout_secs: u64,

    /// Tentativas extras além do número de chaves vivas em cada varredura.
    #[serde(default = "default_attempt_margin")]
    pub attempt_margin: usize,

    /// Falhas críticas consecutivas até o LOCKDOWN.
    #[serde(default = "default_lockdown_threshold")]
    pub lockdown_threshold: u32,

    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,

    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,

    /// Falhas fatais (auth/quota) até uma chave ser considerada morta.
    #[serde(default = "default_dead_after_failures")]
    pub dead_after_failures: u32,

    /// Pausa de uma chave após HTTP 429 sem `retry-after`.
    #[serde(default = "default_rate_limit_cooldown_secs")]
    pub rate_limit_cooldown_secs: u64,

    /// Tabela de escalonamento, em segundos.
    #[serde(default = "default_escalation_secs")]
    pub escalation_secs: Vec<u64>,

    /// Pausa entre unidades de um mesmo worker, em milissegundos.
    #[serde(default = "default_unit_pause_ms")]
    pub unit_pause_ms: u64,

    #[serde(default = "default_jobs_file")]
    pub jobs_file: PathBuf,

    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Faz commit das saídas no repositório git ao fim da missão.
    #[serde(default)]
    pub auto_commit: bool,
}

fn default_model() -> String {
    "claude-sonnet-4-5-20250929".to_string()
}

fn default_probe_model() -> String {
    "claude-haiku-4-5-20251001".to_string()
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_workers() -> usize {
    2
}

fn default_page_size() -> usize {
    20
}

fn default_attempt_timeout_secs() -> u64 {
    120
}

fn default_attempt_margin() -> usize {
    2
}

fn default_lockdown_threshold() -> u32 {
    3
}

fn default_probe_interval_secs() -> u64 {
    60
}

fn default_probe_timeout_secs() -> u64 {
    30
}

fn default_dead_after_failures() -> u32 {
    3
}

fn default_rate_limit_cooldown_secs() -> u64 {
    60
}

// 1min, 2min, 10min, 30min, 1h, 2h, 4h.
fn default_escalation_secs() -> Vec<u64> {
    vec![60, 120, 600, 1800, 3600, 7200, 14400]
}

fn default_unit_pause_ms() -> u64 {
    1000
}

fn default_jobs_file() -> PathBuf {
    PathBuf::from("jobs.toml")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("outputs")
}

impl Default for KeyswarmConfig {
    fn default() -> Self {
        Self {
            api_keys: Vec::new(),
            model: default_model(),
            probe_model: default_probe_model(),
            max_tokens: default_max_tokens(),
            workers: default_workers(),
            page_size: default_page_size(),
            attempt_timeout_secs: default_attempt_timeout_secs(),
            attempt_margin: default_attempt_margin(),
            lockdown_threshold: default_lockdown_threshold(),
            probe_interval_secs: default_probe_interval_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
            dead_after_failures: default_dead_after_failures(),
            rate_limit_cooldown_secs: default_rate_limit_cooldown_secs(),
            escalation_secs: default_escalation_secs(),
            unit_pause_ms: default_unit_pause_ms(),
            jobs_file: default_jobs_file(),
            output_dir: default_output_dir(),
            auto_commit: false,
        }
    }
}

impl KeyswarmConfig {
    /// Carrega a configuração de `keyswarm.toml` no diretório atual.
    pub fn load() -> Result<Self, KeyswarmError> {
        Self::load_from(Path::new(CONFIG_FILE))
    }

    /// Carrega de `path`, usando os defaults se o arquivo não existir,
    /// e aplica as variáveis de ambiente.
    pub fn load_from(path: &Path) -> Result<Self, KeyswarmError> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            toml::from_str::<KeyswarmConfig>(&contents)?
        } else {
            Self::default()
        };

        config.apply_env(
            std::env::var("ANTHROPIC_API_KEYS").ok(),
            std::env::var("ANTHROPIC_API_KEY").ok(),
        );
        Ok(config)
    }

    // Separado de `load_from` para ser testável sem mexer no ambiente do processo.
    fn apply_env(&mut self, keys: Option<String>, single: Option<String>) {
        if let Some(list) = keys {
            let parsed: Vec<String> = list
                .split(',')
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(String::from)
                .collect();
            if !parsed.is_empty() {
                self.api_keys = parsed;
            }
        }

        if self.api_keys.iter().all(|k| k.trim().is_empty())
            && let Some(key) = single
            && !key.trim().is_empty()
        {
            self.api_keys = vec![key.trim().to_string()];
        }
    }

    /// Rejeita valores que tornariam a missão impossível.
    pub fn validate(&self) -> Result<(), KeyswarmError> {
        if self.workers == 0 {
            return Err(KeyswarmError::Config("workers must be at least 1".into()));
        }
        if self.page_size == 0 {
            return Err(KeyswarmError::Config("page_size must be at least 1".into()));
        }
        if self.lockdown_threshold == 0 {
            return Err(KeyswarmError::Config(
                "lockdown_threshold must be at least 1".into(),
            ));
        }
        if self.escalation_secs.is_empty() {
            return Err(KeyswarmError::Config(
                "escalation_secs needs at least one step".into(),
            ));
        }
        if self.attempt_timeout_secs == 0 {
            return Err(KeyswarmError::Config(
                "attempt_timeout_secs must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Falha com [`KeyswarmError::NoCredentials`] se nenhuma chave foi configurada.
    pub fn require_keys(&self) -> Result<&[String], KeyswarmError> {
        if self.api_keys.iter().all(|k| k.trim().is_empty()) {
            return Err(KeyswarmError::NoCredentials);
        }
        Ok(&self.api_keys)
    }

    pub fn pool_policy(&self) -> PoolPolicy {
        PoolPolicy {
            dead_after_failures: self.dead_after_failures,
            rate_limit_cooldown: Duration::from_secs(self.rate_limit_cooldown_secs),
        }
    }

    pub fn escalation(&self) -> EscalationSchedule {
        EscalationSchedule::from_secs(&self.escalation_secs)
    }

    pub fn mission_config(&self) -> MissionConfig {
        MissionConfig {
            workers: self.workers,
            page_size: self.page_size,
            attempt_timeout: Duration::from_secs(self.attempt_timeout_secs),
            attempt_margin: self.attempt_margin,
            unit_pause: Duration::from_millis(self.unit_pause_ms),
            escalation: self.escalation(),
            probe_interval: Duration::from_secs(self.probe_interval_secs),
            probe_timeout: Duration::from_secs(self.probe_timeout_secs),
        }
    }
}
