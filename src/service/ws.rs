//! Progress channel: one WebSocket connection per compile job.
//!
//! ```text
//!   /_pg/ only: wait ≤ instruction_timeout for Compile{files}
//!        │
//!   admission ──full──▶ Error, close
//!        │ backlog
//!        ├──▶ Queued{position} … wait for a slot
//!        ▼
//!   get_or_build ──progress──▶ Downloading / Compiling / Storing
//!        │
//!        ▼
//!   Done{artifact} | Error{message}, close
//! ```
//!
//! While the job is queued or building, the loop also pings the client
//! every `ping_interval`. A client that has not answered for longer than
//! `pong_timeout` when the next ping is due is dropped; with the default
//! 10s/20s settings that is two missed pongs. Dropping the connection only
//! drops this requester's admission slot and its view of the build.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::Message;
use compile_common::{ClientInstruction, JobState, ProgressMessage, ProgressSink, SourceReference};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval};
use tracing::{debug, info, warn};

use crate::admission::{Admission, AdmissionQueue};
use crate::backends::SourceBundle;
use crate::cache::{BuildCache, BuildSource};
use crate::errors::{ChannelError, ServiceError, StreamError};
use crate::job::BuildJob;
use crate::reporter::ErrorReporter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSettings {
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
    pub write_timeout: Duration,
    pub instruction_timeout: Duration,
}

/// What a connection asked for.
#[derive(Debug, Clone)]
pub enum JobRequest {
    /// `/_ws/<path>`: build a normalized reference.
    Path(SourceReference),
    /// `/_pg/`: sources arrive in the first client message.
    Playground,
}

/// Reference under which an inline bundle is cached.
pub fn playground_reference(bundle: &SourceBundle) -> SourceReference {
    SourceReference::from_normalized(format!("playground/{}", bundle.digest()))
}

#[derive(Clone)]
pub struct ProgressChannel {
    admission: AdmissionQueue,
    cache: BuildCache,
    reporter: ErrorReporter,
    settings: ChannelSettings,
}

impl ProgressChannel {
    pub fn new(
        admission: AdmissionQueue,
        cache: BuildCache,
        reporter: ErrorReporter,
        settings: ChannelSettings,
    ) -> Self {
        Self {
            admission,
            cache,
            reporter,
            settings,
        }
    }

    /// Run one job over a split connection and close it.
    ///
    /// Returns the job's terminal state, or how the connection ended early.
    pub async fn serve<S, R, E>(
        &self,
        sink: S,
        stream: R,
        request: JobRequest,
        source_ip: Option<String>,
    ) -> Result<JobState, ChannelError>
    where
        S: Sink<Message> + Unpin,
        S::Error: Display,
        R: Stream<Item = Result<Message, E>> + Unpin,
        E: Display,
    {
        let mut conn = Connection::new(sink, stream, self.settings);
        let result = self.run(&mut conn, request, source_ip.as_deref()).await;
        match &result {
            Ok(state) => debug!(%state, "job finished"),
            Err(ChannelError::Closed) => info!("client went away"),
            Err(e @ ChannelError::Write(StreamError::Timeout { .. })) => {
                warn!(target: "transport", error = %e, "dropping slow client")
            }
            Err(e) => warn!(error = %e, "progress channel ended"),
        }
        conn.close().await;
        result
    }

    async fn run<S, R, E>(
        &self,
        conn: &mut Connection<S, R>,
        request: JobRequest,
        source_ip: Option<&str>,
    ) -> Result<JobState, ChannelError>
    where
        S: Sink<Message> + Unpin,
        S::Error: Display,
        R: Stream<Item = Result<Message, E>> + Unpin,
        E: Display,
    {
        let (reference, source) = match request {
            JobRequest::Path(reference) => (reference, BuildSource::Remote),
            JobRequest::Playground => match conn.await_instruction().await {
                Ok(bundle) => (playground_reference(&bundle), BuildSource::Inline(bundle)),
                Err(e @ ChannelError::BadInstruction(_)) => {
                    let mut job = BuildJob::new(SourceReference::from_normalized("playground"));
                    return self
                        .fail(conn, &mut job, ServiceError::Channel(e), source_ip)
                        .await;
                }
                Err(e) => return Err(e),
            },
        };

        let mut job = BuildJob::new(reference.clone());
        let (progress, mut rx) = ProgressSink::channel();

        let _permit = match self.admission.reserve(reference.path()) {
            Ok(Admission::Ready(permit)) => permit,
            Ok(Admission::Waiting(ticket)) => {
                conn.forward(
                    &mut job,
                    ProgressMessage::Queued {
                        position: ticket.position(),
                    },
                )
                .await?;
                match conn.supervise(&mut job, &mut rx, ticket.wait()).await? {
                    Ok(permit) => permit,
                    Err(e) => {
                        return self.fail(conn, &mut job, e.into(), source_ip).await;
                    }
                }
            }
            Err(e) => return self.fail(conn, &mut job, e.into(), source_ip).await,
        };
        info!(job_id = %job.id(), path = %reference, "job admitted");

        let build = self.cache.get_or_build(&reference, source, &progress);
        let result = conn.supervise(&mut job, &mut rx, build).await?;
        while let Ok(message) = rx.try_recv() {
            conn.forward(&mut job, message).await?;
        }

        match result {
            Ok(artifact) => {
                info!(
                    job_id = %job.id(),
                    key = %artifact.key,
                    cached = artifact.cached,
                    elapsed_ms = job.elapsed_ms(),
                    "job done"
                );
                conn.forward(&mut job, ProgressMessage::Done { artifact })
                    .await?;
                Ok(JobState::Done)
            }
            Err(e) => self.fail(conn, &mut job, e.into(), source_ip).await,
        }
    }

    async fn fail<S, R, E>(
        &self,
        conn: &mut Connection<S, R>,
        job: &mut BuildJob,
        err: ServiceError,
        source_ip: Option<&str>,
    ) -> Result<JobState, ChannelError>
    where
        S: Sink<Message> + Unpin,
        S::Error: Display,
        R: Stream<Item = Result<Message, E>> + Unpin,
        E: Display,
    {
        info!(
            job_id = %job.id(),
            path = %job.reference(),
            state = %job.state(),
            error = %err,
            "job failed"
        );
        self.reporter.report(&err, source_ip).await;
        conn.forward(job, ProgressMessage::error(err.to_string()))
            .await?;
        Ok(JobState::Failed)
    }
}

/// Transport plus keepalive bookkeeping.
struct Connection<S, R> {
    sink: S,
    stream: R,
    settings: ChannelSettings,
    ticker: Interval,
    last_pong: Instant,
    awaiting_pong: bool,
}

impl<S, R, E> Connection<S, R>
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    fn new(sink: S, stream: R, settings: ChannelSettings) -> Self {
        let first_ping = Instant::now() + settings.ping_interval;
        Self {
            sink,
            stream,
            settings,
            ticker: tokio::time::interval_at(first_ping, settings.ping_interval),
            last_pong: Instant::now(),
            awaiting_pong: false,
        }
    }

    async fn write(&mut self, frame: Message) -> Result<(), ChannelError> {
        let after = self.settings.write_timeout;
        match tokio::time::timeout(after, self.sink.send(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ChannelError::Transport(e.to_string())),
            Err(_) => Err(ChannelError::Write(StreamError::Timeout { after })),
        }
    }

    /// Send `message` and move the job along.
    async fn forward(
        &mut self,
        job: &mut BuildJob,
        message: ProgressMessage,
    ) -> Result<(), ChannelError> {
        if let Err(e) = job.observe(&message) {
            debug!(job_id = %job.id(), error = %e, "out-of-order progress");
        }
        let json = serde_json::to_string(&message)
            .map_err(|e| ChannelError::Transport(e.to_string()))?;
        self.write(Message::text(json)).await
    }

    async fn ping(&mut self) -> Result<(), ChannelError> {
        if self.awaiting_pong && self.last_pong.elapsed() > self.settings.pong_timeout {
            return Err(ChannelError::KeepaliveExpired {
                after: self.settings.pong_timeout,
            });
        }
        self.write(Message::Ping(Bytes::new())).await?;
        self.awaiting_pong = true;
        Ok(())
    }

    /// Handle one inbound frame; returns data frames to the caller.
    fn on_frame(&mut self, frame: Option<Result<Message, E>>) -> Result<Option<Message>, ChannelError> {
        match frame {
            Some(Ok(Message::Pong(_))) => {
                self.last_pong = Instant::now();
                self.awaiting_pong = false;
                Ok(None)
            }
            Some(Ok(Message::Ping(_))) => Ok(None),
            Some(Ok(Message::Close(_))) | None => Err(ChannelError::Closed),
            Some(Ok(data)) => Ok(Some(data)),
            Some(Err(e)) => Err(ChannelError::Transport(e.to_string())),
        }
    }

    /// Drive `work` to completion while forwarding progress, pinging, and
    /// watching for the client going away.
    async fn supervise<F: Future>(
        &mut self,
        job: &mut BuildJob,
        rx: &mut mpsc::Receiver<ProgressMessage>,
        work: F,
    ) -> Result<F::Output, ChannelError> {
        tokio::pin!(work);
        loop {
            tokio::select! {
                output = &mut work => return Ok(output),
                Some(message) = rx.recv() => self.forward(job, message).await?,
                _ = self.ticker.tick() => self.ping().await?,
                frame = self.stream.next() => {
                    if self.on_frame(frame)?.is_some() {
                        debug!(job_id = %job.id(), "ignoring client message during build");
                    }
                }
            }
        }
    }

    async fn next_data(&mut self) -> Result<Message, ChannelError> {
        loop {
            let frame = self.stream.next().await;
            if let Some(data) = self.on_frame(frame)? {
                return Ok(data);
            }
        }
    }

    /// Wait for the playground's `Compile` instruction.
    async fn await_instruction(&mut self) -> Result<SourceBundle, ChannelError> {
        let after = self.settings.instruction_timeout;
        let frame = tokio::time::timeout(after, self.next_data())
            .await
            .map_err(|_| ChannelError::InstructionTimeout { after })??;

        let instruction: ClientInstruction = match &frame {
            Message::Text(text) => serde_json::from_str(text.as_str()),
            Message::Binary(bytes) => serde_json::from_slice(bytes),
            _ => return Err(ChannelError::BadInstruction("expected a JSON message".into())),
        }
        .map_err(|e| ChannelError::BadInstruction(e.to_string()))?;

        let ClientInstruction::Compile { files } = instruction;
        if files.is_empty() {
            return Err(ChannelError::BadInstruction("no source files".into()));
        }
        Ok(SourceBundle {
            revision: None,
            files: files
                .into_iter()
                .map(|(name, content)| (name, content.into_bytes()))
                .collect(),
        })
    }

    async fn close(mut self) {
        let _ = tokio::time::timeout(
            self.settings.write_timeout,
            self.sink.send(Message::Close(None)),
        )
        .await;
    }
}
