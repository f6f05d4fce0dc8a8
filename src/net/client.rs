//! Registry client
//!
//! Worker-side handle to the coordinator. Each worker holds its own
//! private connection; there is no shared client state between workers,
//! so correctness rests entirely on the server-side protocol contract.
//!
//! Errors are split into the categories a worker must treat differently:
//! a rejected handshake and a lost connection are both fatal, but they
//! produce different diagnostics before the process exits.

use crate::net::protocol::*;
use crate::registry::CurveTask;
use num_bigint::BigUint;
use thiserror::Error;
use tokio::net::TcpStream;

/// Client-side failure categories
#[derive(Debug, Error)]
pub enum ClientError {
    /// Coordinator refused the handshake (wrong secret, version mismatch)
    #[error("coordinator rejected handshake: {0}")]
    Rejected(String),

    /// Cannot reach, or lost contact with, the coordinator
    #[error("lost contact with coordinator: {0}")]
    Connectivity(String),

    /// The coordinator answered with something the protocol does not allow
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Registry client, one per worker
pub struct RegistryClient {
    stream: TcpStream,
}

impl RegistryClient {
    /// Connect to the coordinator and perform the authenticated handshake.
    ///
    /// Returns the number of tasks the registry holds on success.
    pub async fn connect(addr: &str, secret: &str) -> Result<(Self, usize), ClientError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| ClientError::Connectivity(format!("connect to {}: {}", addr, e)))?;

        let mut client = Self { stream };

        client
            .send(&Message::Hello(HelloMessage {
                protocol_version: PROTOCOL_VERSION,
                secret: secret.to_string(),
            }))
            .await?;

        match client.receive().await? {
            Message::HelloAck(ack) => Ok((client, ack.task_count)),
            Message::Error(err) => Err(ClientError::Rejected(err.error)),
            other => Err(ClientError::Protocol(format!(
                "expected HELLO_ACK, got {:?}",
                other
            ))),
        }
    }

    /// Fetch a full consistent snapshot of the registry
    pub async fn fetch_all(&mut self) -> Result<Vec<CurveTask>, ClientError> {
        self.send(&Message::FetchAll).await?;

        match self.receive().await? {
            Message::Tasks(tasks) => Ok(tasks.tasks),
            Message::Error(err) => Err(ClientError::Protocol(err.error)),
            other => Err(ClientError::Protocol(format!(
                "expected TASKS, got {:?}",
                other
            ))),
        }
    }

    /// Atomically propose an improvement for one task
    ///
    /// `accepted = false` is not a failure: the trial still counted, the
    /// report just lost a race to a better curve.
    pub async fn propose_improvement(
        &mut self,
        name: &str,
        observed_best: f64,
        candidate_score: f64,
        a: &BigUint,
        b: &BigUint,
        samples_delta: u64,
    ) -> Result<ProposeOutcomeMessage, ClientError> {
        self.send(&Message::ProposeImprovement(ProposeImprovementMessage {
            name: name.to_string(),
            observed_best,
            candidate_score,
            a: a.clone(),
            b: b.clone(),
            samples_delta,
        }))
        .await?;

        match self.receive().await? {
            Message::ProposeOutcome(outcome) => Ok(outcome),
            Message::Error(err) => Err(ClientError::Protocol(err.error)),
            other => Err(ClientError::Protocol(format!(
                "expected PROPOSE_OUTCOME, got {:?}",
                other
            ))),
        }
    }

    /// Credit a batch of trials that produced no improvement
    pub async fn record_exhausted(
        &mut self,
        name: &str,
        samples_delta: u64,
    ) -> Result<(), ClientError> {
        self.send(&Message::RecordExhausted(RecordExhaustedMessage {
            name: name.to_string(),
            samples_delta,
        }))
        .await?;

        match self.receive().await? {
            Message::ExhaustedAck => Ok(()),
            Message::Error(err) => Err(ClientError::Protocol(err.error)),
            other => Err(ClientError::Protocol(format!(
                "expected EXHAUSTED_ACK, got {:?}",
                other
            ))),
        }
    }

    async fn send(&mut self, msg: &Message) -> Result<(), ClientError> {
        write_message(&mut self.stream, msg)
            .await
            .map_err(|e| ClientError::Connectivity(format!("{:#}", e)))
    }

    async fn receive(&mut self) -> Result<Message, ClientError> {
        read_message(&mut self.stream)
            .await
            .map_err(|e| ClientError::Connectivity(format!("{:#}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::server::RegistryServer;
    use crate::registry::{self, CurveTask, TaskRegistry};

    async fn spawn_server(scores: &[(&str, f64)], secret: &str) -> (String, registry::SharedRegistry) {
        let shared = registry::shared(TaskRegistry::new(scores.iter().map(|(name, score)| {
            let mut task = CurveTask::new(*name, BigUint::from(101u32));
            task.best_score = *score;
            task
        })));

        let listener = RegistryServer::bind("127.0.0.1", 0).await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let server = RegistryServer::new(shared.clone(), secret.to_string());
        tokio::spawn(server.run(listener));

        (addr, shared)
    }

    #[tokio::test]
    async fn test_handshake_and_fetch() {
        let (addr, _) = spawn_server(&[("A", 40.0), ("B", 12.0)], "hunter2").await;

        let (mut client, task_count) = RegistryClient::connect(&addr, "hunter2").await.unwrap();
        assert_eq!(task_count, 2);

        let tasks = client.fetch_all().await.unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].name, "A");
    }

    #[tokio::test]
    async fn test_wrong_secret_rejected() {
        let (addr, _) = spawn_server(&[("A", 40.0)], "hunter2").await;

        match RegistryClient::connect(&addr, "wrong").await {
            Err(ClientError::Rejected(msg)) => {
                assert!(msg.contains("authentication"));
            }
            other => panic!("Expected rejection, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_concurrent_proposals_no_lost_update() {
        let (addr, shared) = spawn_server(&[("A", 40.0)], "hunter2").await;

        // Two workers, both observed 40.0, racing with different candidates
        let mut handles = Vec::new();
        for score in [35.0, 32.0] {
            let addr = addr.clone();
            handles.push(tokio::spawn(async move {
                let (mut client, _) = RegistryClient::connect(&addr, "hunter2").await.unwrap();
                client
                    .propose_improvement(
                        "A",
                        40.0,
                        score,
                        &BigUint::from(1u32),
                        &BigUint::from(2u32),
                        1,
                    )
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let guard = registry::lock(&shared);
        let task = guard.get("A").unwrap();
        assert_eq!(task.best_score, 32.0);
        assert_eq!(task.samples, 2);
    }

    #[tokio::test]
    async fn test_exhausted_batch_counted() {
        let (addr, shared) = spawn_server(&[("A", 40.0)], "hunter2").await;

        let (mut client, _) = RegistryClient::connect(&addr, "hunter2").await.unwrap();
        client.record_exhausted("A", 100).await.unwrap();

        let guard = registry::lock(&shared);
        let task = guard.get("A").unwrap();
        assert_eq!(task.samples, 100);
        assert_eq!(task.best_score, 40.0);
    }

    #[tokio::test]
    async fn test_unknown_task_is_protocol_error() {
        let (addr, _) = spawn_server(&[("A", 40.0)], "hunter2").await;

        let (mut client, _) = RegistryClient::connect(&addr, "hunter2").await.unwrap();
        match client.record_exhausted("missing", 1).await {
            Err(ClientError::Protocol(msg)) => assert!(msg.contains("unknown task")),
            other => panic!("Expected protocol error, got {:?}", other),
        }
    }
}
