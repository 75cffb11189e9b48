//! cd: change the working directory of the running command.
//!
//! The change is recorded in the environment, so a job or worker running
//! `cd` reports it back to its parent as part of its environment delta.

use std::path::PathBuf;

use async_trait::async_trait;

use obsh_types::Value;

use crate::command::ExecContext;
use crate::error::Abort;
use crate::op::{Emitter, Operator};

pub struct Cd {
    path: PathBuf,
    resolved: Option<PathBuf>,
}

impl Cd {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            resolved: None,
        }
    }
}

#[async_trait]
impl Operator for Cd {
    fn name(&self) -> &str {
        "cd"
    }

    fn must_be_first(&self) -> bool {
        true
    }

    async fn setup_1(&mut self, ctx: &ExecContext) -> Result<(), Abort> {
        let resolved = ctx.env.resolve(&self.path);
        match tokio::fs::metadata(&resolved).await {
            Ok(meta) if meta.is_dir() => {
                self.resolved = Some(resolved);
                Ok(())
            }
            Ok(_) => Err(Abort::command(
                "cd",
                format!("{}: not a directory", self.path.display()),
            )),
            Err(e) => Err(Abort::command("cd", format!("{}: {}", self.path.display(), e))),
        }
    }

    async fn run(&mut self, out: &mut Emitter<'_>) -> Result<(), Abort> {
        let resolved = self
            .resolved
            .take()
            .ok_or_else(|| Abort::Protocol("cd run before setup".to_string()))?;
        tracing::debug!("cd {}", resolved.display());
        out.env_mut().set_cwd(resolved);
        Ok(())
    }

    async fn receive(&mut self, _item: Value, _out: &mut Emitter<'_>) -> Result<(), Abort> {
        Err(Abort::command("cd", "does not accept upstream input"))
    }
}
