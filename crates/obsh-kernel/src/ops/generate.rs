//! generate: emit the integers `0..count`.

use async_trait::async_trait;

use obsh_types::Value;

use crate::error::Abort;
use crate::op::{Emitter, Operator};

pub struct Generate {
    count: u64,
}

impl Generate {
    pub fn new(count: u64) -> Self {
        Self { count }
    }
}

#[async_trait]
impl Operator for Generate {
    fn name(&self) -> &str {
        "generate"
    }

    fn must_be_first(&self) -> bool {
        true
    }

    async fn run(&mut self, out: &mut Emitter<'_>) -> Result<(), Abort> {
        let count = i64::try_from(self.count)
            .map_err(|_| Abort::command("generate", format!("count too large: {}", self.count)))?;
        for i in 0..count {
            out.send(Value::Int(i)).await?;
        }
        Ok(())
    }

    async fn receive(&mut self, _item: Value, _out: &mut Emitter<'_>) -> Result<(), Abort> {
        Err(Abort::command("generate", "does not accept upstream input"))
    }
}
