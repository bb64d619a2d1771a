//! Integração com Git via libgit2 para versionar as saídas de uma missão.
//!
//! O [`GitManager`] encapsula o commit das saídas geradas e a consulta
//! da branch atual.

use anyhow::{Context, Result};
use git2::{IndexAddOption, Repository, Signature};
use std::path::Path;

use crate::orchestrator::MissionReport;

/// Arquivos nunca adicionados ao stage por conterem segredos.
const EXCLUDED: [&str; 3] = ["keyswarm.toml", ".env", ".env.local"];

fn is_secret(path: &Path) -> bool {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    EXCLUDED.contains(&name) || name.ends_with(".key")
}

/// Gerenciador de operações Git usando a biblioteca libgit2.
pub struct GitManager {
    repo: Repository,
}

impl GitManager {
    /// Abre o repositório git que contém `path`, subindo pelos diretórios pais.
    pub fn open(path: &Path) -> Result<Self> {
        let repo = Repository::discover(path).context("failed to open git repository")?;
        Ok(Self { repo })
    }

    /// Adiciona ao stage os arquivos que casam com `pathspec` e cria um commit,
    /// retornando o hash curto. `None` se não houver nada novo para commitar.
    ///
    /// Arquivos sensíveis (keyswarm.toml, .env, .env.local, *.key) são excluídos
    /// do staging para evitar exposição acidental de chaves.
    pub fn commit(&self, pathspec: &str, message: &str) -> Result<Option<String>> {
        let mut index = self.repo.index()?;
        index.add_all(
            [pathspec].iter(),
            IndexAddOption::DEFAULT,
            Some(&mut |path: &Path, _: &[u8]| -> i32 {
                if is_secret(path) { 1 } else { 0 }
            }),
        )?;
        index.write()?;

        let tree_oid = index.write_tree()?;
        let parent = match self.repo.head() {
            Ok(head) => Some(head.peel_to_commit()?),
            // Repositório recém-criado, ainda sem HEAD.
            Err(e) if e.code() == git2::ErrorCode::UnbornBranch => None,
            Err(e) => return Err(e.into()),
        };
        if parent.as_ref().is_some_and(|p| p.tree_id() == tree_oid) {
            return Ok(None);
        }
        let tree = self.repo.find_tree(tree_oid)?;

        let sig = self
            .repo
            .signature()
            .or_else(|_| Signature::now("keyswarm", "keyswarm@localhost"))?;

        let parents: Vec<&git2::Commit> = parent.iter().collect();
        let commit_oid = self
            .repo
            .commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;

        let short = &commit_oid.to_string()[..7];
        Ok(Some(short.to_string()))
    }

    /// Commita o diretório de saídas com um resumo da missão.
    ///
    /// Formato da mensagem: `keyswarm: persist N outputs (mission <id>)`
    pub fn commit_outputs(&self, output_dir: &Path, report: &MissionReport) -> Result<Option<String>> {
        let workdir = self
            .repo
            .workdir()
            .context("repository has no working directory")?;
        let absolute = std::fs::canonicalize(output_dir)
            .with_context(|| format!("resolving {}", output_dir.display()))?;
        let root = std::fs::canonicalize(workdir)?;
        let relative = absolute
            .strip_prefix(&root)
            .with_context(|| format!("{} is outside the repository", output_dir.display()))?;

        let mut pathspec = relative.to_string_lossy().replace('\\', "/");
        pathspec.push_str("/*");
        let message = format!(
            "keyswarm: persist {} outputs (mission {})",
            report.done(),
            report.mission_id
        );
        self.commit(&pathspec, &message)
    }

    /// Retorna o nome da branch atual.
    pub fn current_branch(&self) -> Result<String> {
        let head = self.repo.head()?;
        let name = head
            .shorthand()
            .context("branch name is not valid UTF-8")?
            .to_string();
        Ok(name)
    }
}
