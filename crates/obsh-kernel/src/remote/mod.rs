//! Remote Runner: executing a shipped pipeline in a child process.
//!
//! A runner receives a [`RunRequest`] on its input channel, runs it with a
//! relay as the terminal node, and writes result frames to its output
//! channel. The same executor, [`run_request`], serves runner processes,
//! jobs and in-process workers, so every place a pipeline can run reports
//! items, errors and aborts in one wire form.
//!
//! Protocol on the runner's channels:
//!
//! ```text
//!   stdin:  <RunRequest>\n [<signal number>\n]
//!   stdout: <Frame>\n ... {"kind":"end"}\n
//! ```
//!
//! End of input before a signal number means "run to completion". A signal
//! number means "deliver this signal to my process tree".

mod serve;
mod signal;

pub use serve::{RunnerError, ServeOutcome, serve};
pub use signal::{OsSignalDelivery, SignalDelivery, descendants};

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use obsh_types::{Frame, WorkerId};

use crate::command::{Command, ErrorPolicy, ExecContext};
use crate::config::KernelConfig;
use crate::env::Env;
use crate::error::{Abort, WireError};
use crate::fork::{Relay, RelayOutput, shared_writer};
use crate::op::Discard;
use crate::pipeline::Pipeline;
use crate::spec::PipelineSpec;

/// A pipeline shipped to a child, with the environment it runs in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    pub pipeline: PipelineSpec,
    pub env: Env,
    /// Tag every item with this worker identity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<WorkerId>,
}

impl RunRequest {
    pub fn new(pipeline: PipelineSpec, env: Env) -> Self {
        Self {
            pipeline,
            env,
            tag: None,
        }
    }
}

/// Run one request, writing its frames to `output`.
///
/// A command-fatal abort is sent as an `Abort` frame, environment changes as
/// an `Env` frame, and the stream always finishes with `End` unless the
/// output itself failed.
pub async fn run_request(request: RunRequest, output: RelayOutput, config: Arc<KernelConfig>) -> Result<(), WireError> {
    let writer = shared_writer(output);
    let RunRequest { pipeline, env, tag } = request;

    let outcome = match Pipeline::from_spec(&pipeline) {
        Ok(mut pipeline) => {
            let mut relay = Relay::new(writer.clone());
            if let Some(tag) = tag {
                relay = relay.tagged(tag.to_value());
            }
            pipeline.append(Box::new(relay));

            let ctx = ExecContext::new(env, config);
            let mut command = Command::new(pipeline, ctx).with_policy(ErrorPolicy::Forward);
            command.execute(Vec::new(), &mut Discard).await
        }
        Err(abort) => Err(abort),
    };

    let mut writer = writer.lock().await;
    match outcome {
        Ok(delta) => {
            if !delta.is_empty() {
                writer.write(&Frame::Env(delta)).await?;
            }
        }
        Err(Abort::Closed) => {
            tracing::debug!("output closed, not finishing the stream");
            return Ok(());
        }
        Err(abort) => {
            tracing::debug!("run aborted: {}", abort);
            writer.write(&Frame::Abort(abort.to_error_value())).await?;
        }
    }
    writer.finish().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::OpSpec;
    use crate::wire::FrameReader;
    use obsh_types::Value;
    use tokio::io::BufReader;

    async fn frames(request: RunRequest) -> Vec<Frame> {
        let (writer, reader) = tokio::io::duplex(1024);
        let task = tokio::spawn(run_request(request, Box::new(writer), Arc::new(KernelConfig::default())));
        let mut reader = FrameReader::new(BufReader::new(reader));
        let mut frames = Vec::new();
        while let Some(frame) = reader.next().await.unwrap() {
            frames.push(frame);
        }
        task.await.unwrap().unwrap();
        frames
    }

    #[tokio::test]
    async fn test_items_then_end() {
        let request = RunRequest::new(PipelineSpec::new(vec![OpSpec::Generate { count: 2 }]), Env::new("/"));
        assert_eq!(
            frames(request).await,
            vec![
                Frame::Data(Value::Int(0)),
                Frame::Data(Value::Int(1)),
                Frame::End
            ]
        );
    }

    #[tokio::test]
    async fn test_abort_is_serialised() {
        let request = RunRequest::new(
            PipelineSpec::new(vec![OpSpec::Generate { count: 1 }, OpSpec::map("|x| (")]),
            Env::new("/"),
        );
        let frames = frames(request).await;
        assert_eq!(frames.len(), 2);
        assert!(matches!(&frames[0], Frame::Abort(e) if e.op.as_deref() == Some("map")));
        assert_eq!(frames[1], Frame::End);
    }

    #[tokio::test]
    async fn test_env_delta_reported() {
        let dir = tempfile::tempdir().unwrap();
        let request = RunRequest::new(
            PipelineSpec::new(vec![OpSpec::Cd {
                path: dir.path().to_path_buf(),
            }]),
            Env::new("/"),
        );
        let frames = frames(request).await;
        match &frames[0] {
            Frame::Env(delta) => assert_eq!(delta.cwd.as_deref(), Some(dir.path())),
            other => panic!("expected env frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_tagged_items() {
        let mut request = RunRequest::new(PipelineSpec::new(vec![OpSpec::Generate { count: 1 }]), Env::new("/"));
        request.tag = Some(WorkerId::Host("db1".into()));
        assert_eq!(
            frames(request).await[0],
            Frame::Data(Value::List(vec![Value::from("db1"), Value::Int(0)]))
        );
    }
}
