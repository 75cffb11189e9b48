//! values: emit literal items.

use async_trait::async_trait;

use obsh_types::Value;

use crate::error::Abort;
use crate::op::{Emitter, Operator};

pub struct Values {
    items: Vec<Value>,
}

impl Values {
    pub fn new(items: Vec<Value>) -> Self {
        Self { items }
    }
}

#[async_trait]
impl Operator for Values {
    fn name(&self) -> &str {
        "values"
    }

    fn must_be_first(&self) -> bool {
        true
    }

    async fn run(&mut self, out: &mut Emitter<'_>) -> Result<(), Abort> {
        for item in self.items.iter().cloned() {
            out.send(item).await?;
        }
        Ok(())
    }

    async fn receive(&mut self, _item: Value, _out: &mut Emitter<'_>) -> Result<(), Abort> {
        Err(Abort::command("values", "does not accept upstream input"))
    }
}
