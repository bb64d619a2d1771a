//! Interface de linha de comando do keyswarm baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (run, status, probe)
//! e flags globais (--config, --verbose).

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::{CONFIG_FILE, KeyswarmConfig};

/// keyswarm: processa um backlog de jobs de IA sobre um pool de chaves resiliente.
#[derive(Debug, Parser)]
#[command(name = "keyswarm", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Caminho do arquivo de configuração.
    #[arg(long, global = true, default_value = CONFIG_FILE)]
    pub config: PathBuf,

    /// Habilita saída detalhada (logs em nível debug).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

/// Onde ler os jobs e gravar as saídas; sobrepõe o arquivo de configuração.
#[derive(Debug, Clone, Default, clap::Args)]
pub struct BacklogArgs {
    /// Arquivo JSON ou TOML com as definições de job.
    #[arg(long)]
    pub file: Option<PathBuf>,

    /// Diretório onde as saídas são gravadas.
    #[arg(long)]
    pub output: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Executa uma missão até esgotar o backlog (Ctrl-C para parar).
    Run {
        #[command(flatten)]
        backlog: BacklogArgs,

        /// Número de workers concorrentes.
        #[arg(long)]
        workers: Option<usize>,

        /// Faz commit das saídas no repositório git ao final.
        #[arg(long, default_value_t = false)]
        commit: bool,
    },

    /// Mostra o backlog pendente e o estado das chaves, sem chamar a API.
    Status {
        #[command(flatten)]
        backlog: BacklogArgs,
    },

    /// Envia uma chamada mínima por chave para verificar quais funcionam.
    Probe,
}

impl BacklogArgs {
    /// Aplica as flags sobre a configuração carregada.
    pub fn apply(&self, config: &mut KeyswarmConfig) {
        if let Some(file) = &self.file {
            config.jobs_file = file.clone();
        }
        if let Some(output) = &self.output {
            config.output_dir = output.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_parses_run_subcommand() {
        let cli = Cli::parse_from([
            "keyswarm", "run", "--file", "book.json", "--workers", "4", "--commit",
        ]);
        match cli.command {
            Command::Run {
                backlog,
                workers,
                commit,
            } => {
                assert_eq!(backlog.file, Some(PathBuf::from("book.json")));
                assert!(backlog.output.is_none());
                assert_eq!(workers, Some(4));
                assert!(commit);
            }
            _ => panic!("expected Run command"),
        }
    }

    #[test]
    fn cli_parses_global_flags() {
        let cli = Cli::parse_from(["keyswarm", "--config", "alt.toml", "--verbose", "probe"]);
        assert!(cli.verbose);
        assert_eq!(cli.config, PathBuf::from("alt.toml"));
        assert!(matches!(cli.command, Command::Probe));
    }

    #[test]
    fn config_defaults_to_keyswarm_toml() {
        let cli = Cli::parse_from(["keyswarm", "status"]);
        assert_eq!(cli.config, PathBuf::from("keyswarm.toml"));
    }

    #[test]
    fn backlog_args_override_config() {
        let mut config = KeyswarmConfig::default();
        let args = BacklogArgs {
            file: None,
            output: Some("gen".into()),
        };
        args.apply(&mut config);
        assert_eq!(config.jobs_file, PathBuf::from("jobs.toml"));
        assert_eq!(config.output_dir, PathBuf::from("gen"));
    }

    #[test]
    fn cli_verify() {
        Cli::command().debug_assert();
    }
}
