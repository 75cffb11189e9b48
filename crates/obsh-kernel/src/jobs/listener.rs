//! The job listener thread.
//!
//! One dedicated thread owns the read end of every job's result channel and
//! multiplexes them with a bounded-timeout wait, so channels registered after
//! it started are picked up within one tick. It never touches job state: it
//! only turns frames into [`ListenerEvent`]s for the controlling process.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, TryRecvError};
use std::thread::JoinHandle;
use std::time::Duration;

use futures::stream::{self, BoxStream, SelectAll, StreamExt};
use tokio::io::AsyncBufRead;
use tokio::sync::mpsc::UnboundedSender;

use obsh_types::{Frame, JobId};

use super::JobError;
use crate::wire::FrameReader;

pub type JobChannel = Box<dyn AsyncBufRead + Send + Unpin>;

/// Opens a job's channel inside the listener's runtime.
///
/// OS pipe handles must be registered with the runtime that polls them, so
/// the controlling process hands over a constructor rather than a reader.
pub type ChannelFactory = Box<dyn FnOnce() -> io::Result<JobChannel> + Send>;

#[derive(Debug, Clone, PartialEq)]
pub enum ListenerEvent {
    /// A result frame other than the end marker.
    Frame(JobId, Frame),
    /// The channel is done. `clean` is false if it closed without the end
    /// marker.
    Closed { job: JobId, clean: bool },
}

pub struct Listener {
    register: mpsc::Sender<(JobId, ChannelFactory)>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Listener {
    pub fn start(tick: Duration, events: UnboundedSender<ListenerEvent>) -> Result<Self, JobError> {
        let (register, registrations) = mpsc::channel();
        let stop = Arc::new(AtomicBool::new(false));
        let stopping = stop.clone();

        let thread = std::thread::Builder::new()
            .name("obsh-listener".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(rt) => rt,
                    Err(e) => {
                        tracing::error!("listener runtime failed to start: {}", e);
                        return;
                    }
                };
                runtime.block_on(listen(tick, registrations, events, stopping));
            })
            .map_err(|e| JobError::Listener(e.to_string()))?;

        Ok(Self {
            register,
            stop,
            thread: Some(thread),
        })
    }

    /// Start watching a job's channel.
    pub fn register(&self, job: JobId, factory: ChannelFactory) -> Result<(), JobError> {
        self.register
            .send((job, factory))
            .map_err(|_| JobError::Listener("listener thread has exited".to_string()))
    }

    pub fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            tracing::warn!("listener thread panicked");
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn listen(
    tick: Duration,
    registrations: mpsc::Receiver<(JobId, ChannelFactory)>,
    events: UnboundedSender<ListenerEvent>,
    stop: Arc<AtomicBool>,
) {
    let mut channels: SelectAll<BoxStream<'static, ListenerEvent>> = SelectAll::new();

    while !stop.load(Ordering::Acquire) {
        loop {
            match registrations.try_recv() {
                Ok((job, factory)) => match factory() {
                    Ok(channel) => {
                        tracing::debug!("listener: watching job {}", job);
                        channels.push(job_events(job, channel));
                    }
                    Err(e) => {
                        tracing::warn!("listener: cannot open channel of job {}: {}", job, e);
                        let _ = events.send(ListenerEvent::Closed { job, clean: false });
                    }
                },
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return,
            }
        }

        if channels.is_empty() {
            tokio::time::sleep(tick).await;
            continue;
        }

        if let Ok(Some(event)) = tokio::time::timeout(tick, channels.next()).await {
            if let ListenerEvent::Closed { job, clean } = &event {
                tracing::debug!("listener: retiring job {} (clean: {})", job, clean);
            }
            if events.send(event).is_err() {
                return;
            }
        }
    }
}

/// Events of one job channel, ending with `Closed`.
fn job_events(job: JobId, channel: JobChannel) -> BoxStream<'static, ListenerEvent> {
    stream::unfold(Some(FrameReader::new(channel)), move |reader| async move {
        let mut reader = reader?;
        let event = match reader.next().await {
            Ok(Some(Frame::End)) => ListenerEvent::Closed { job, clean: true },
            Ok(Some(frame)) => return Some((ListenerEvent::Frame(job, frame), Some(reader))),
            Ok(None) => ListenerEvent::Closed { job, clean: false },
            Err(e) => {
                tracing::warn!("listener: job {} channel failed: {}", job, e);
                ListenerEvent::Closed { job, clean: false }
            }
        };
        Some((event, None))
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use obsh_types::Value;

    fn bytes(data: &'static [u8]) -> ChannelFactory {
        Box::new(move || Ok(Box::new(tokio::io::BufReader::new(data)) as JobChannel))
    }

    #[tokio::test]
    async fn test_late_registration_is_picked_up() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut listener = Listener::start(Duration::from_millis(10), tx).unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        listener
            .register(JobId(1), bytes(b"{\"kind\":\"data\",\"body\":{\"Int\":5}}\n{\"kind\":\"end\"}\n"))
            .unwrap();

        assert_eq!(
            rx.recv().await,
            Some(ListenerEvent::Frame(JobId(1), Frame::Data(Value::Int(5))))
        );
        assert_eq!(
            rx.recv().await,
            Some(ListenerEvent::Closed {
                job: JobId(1),
                clean: true
            })
        );
        listener.shutdown();
    }

    #[tokio::test]
    async fn test_truncated_channel() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut listener = Listener::start(Duration::from_millis(10), tx).unwrap();
        listener.register(JobId(2), bytes(b"")).unwrap();

        assert_eq!(
            rx.recv().await,
            Some(ListenerEvent::Closed {
                job: JobId(2),
                clean: false
            })
        );
        listener.shutdown();
    }
}
