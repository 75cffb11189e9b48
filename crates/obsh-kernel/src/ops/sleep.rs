//! sleep: a source that waits and emits nothing.

use std::time::Duration;

use async_trait::async_trait;

use obsh_types::Value;

use crate::error::Abort;
use crate::op::{Emitter, Operator};

pub struct Sleep {
    duration: Duration,
}

impl Sleep {
    pub fn new(ms: u64) -> Self {
        Self {
            duration: Duration::from_millis(ms),
        }
    }
}

#[async_trait]
impl Operator for Sleep {
    fn name(&self) -> &str {
        "sleep"
    }

    fn must_be_first(&self) -> bool {
        true
    }

    async fn run(&mut self, _out: &mut Emitter<'_>) -> Result<(), Abort> {
        tokio::time::sleep(self.duration).await;
        Ok(())
    }

    async fn receive(&mut self, _item: Value, _out: &mut Emitter<'_>) -> Result<(), Abort> {
        Err(Abort::command("sleep", "does not accept upstream input"))
    }
}
