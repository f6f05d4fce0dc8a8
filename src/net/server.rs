//! Registry server
//!
//! Coordinator-side network endpoint. Each accepted connection must open
//! with a `Hello` carrying the shared secret; a wrong secret or protocol
//! version gets an `Error` reply and the connection is dropped before any
//! registry state is exchanged.
//!
//! After the handshake the connection is a simple request/response loop.
//! Every mutating request resolves inside one registry critical section,
//! so concurrent workers can never lose an update to each other.

use crate::net::protocol::*;
use crate::registry::{self, SharedRegistry};
use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};

/// Registry server
///
/// Owns nothing but a handle to the shared registry; connection handlers
/// run as independent tasks.
pub struct RegistryServer {
    registry: SharedRegistry,
    secret: String,
}

impl RegistryServer {
    /// Create a new registry server
    pub fn new(registry: SharedRegistry, secret: String) -> Self {
        Self { registry, secret }
    }

    /// Bind the listening socket
    pub async fn bind(host: &str, port: u16) -> Result<TcpListener> {
        let addr = format!("{}:{}", host, port);
        TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind registry server on {}", addr))
    }

    /// Accept and serve connections until the task is dropped
    pub async fn run(self, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, addr) = listener
                .accept()
                .await
                .context("Failed to accept connection")?;

            let registry = self.registry.clone();
            let secret = self.secret.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(registry, secret, stream).await {
                    eprintln!("Worker connection from {} closed: {:#}", addr, e);
                }
            });
        }
    }
}

/// Serve one worker connection
async fn handle_connection(
    registry: SharedRegistry,
    secret: String,
    mut stream: TcpStream,
) -> Result<()> {
    // Handshake before anything else
    let hello = match read_message(&mut stream).await? {
        Message::Hello(hello) => hello,
        other => {
            reject(&mut stream, "expected HELLO").await?;
            anyhow::bail!("Expected HELLO, got {:?}", other);
        }
    };

    if hello.protocol_version != PROTOCOL_VERSION {
        let error = format!(
            "protocol version mismatch: worker={}, coordinator={}",
            hello.protocol_version, PROTOCOL_VERSION
        );
        reject(&mut stream, &error).await?;
        anyhow::bail!("Protocol version mismatch");
    }

    if hello.secret != secret {
        reject(&mut stream, "authentication rejected").await?;
        anyhow::bail!("Authentication rejected");
    }

    let task_count = registry::lock(&registry).len();
    write_message(
        &mut stream,
        &Message::HelloAck(HelloAckMessage {
            protocol_version: PROTOCOL_VERSION,
            task_count,
        }),
    )
    .await?;

    // Request/response loop; a read error means the worker went away
    loop {
        let request = match read_message(&mut stream).await {
            Ok(msg) => msg,
            Err(_) => return Ok(()),
        };

        let reply = dispatch(&registry, request)?;
        write_message(&mut stream, &reply).await?;
    }
}

/// Resolve one request against the registry
fn dispatch(registry: &SharedRegistry, request: Message) -> Result<Message> {
    match request {
        Message::FetchAll => {
            let tasks = registry::lock(registry).snapshot();
            Ok(Message::Tasks(TasksMessage { tasks }))
        }

        Message::ProposeImprovement(propose) => {
            // Single critical section: compare against the current value
            // and write, indivisibly
            let outcome = registry::lock(registry).propose_improvement(
                &propose.name,
                propose.candidate_score,
                &propose.a,
                &propose.b,
                propose.samples_delta,
            );

            match outcome {
                Some(outcome) => Ok(Message::ProposeOutcome(ProposeOutcomeMessage {
                    accepted: outcome.accepted,
                    current_best: outcome.current_best,
                })),
                None => Ok(unknown_task(&propose.name)),
            }
        }

        Message::RecordExhausted(exhausted) => {
            let result = registry::lock(registry)
                .record_exhausted(&exhausted.name, exhausted.samples_delta);

            match result {
                Some(_) => Ok(Message::ExhaustedAck),
                None => Ok(unknown_task(&exhausted.name)),
            }
        }

        other => anyhow::bail!("Unexpected request: {:?}", other),
    }
}

fn unknown_task(name: &str) -> Message {
    Message::Error(ErrorMessage {
        error: format!("unknown task {:?}", name),
    })
}

/// Send an error reply, ignoring write failures on a connection we are
/// about to drop anyway
async fn reject(stream: &mut TcpStream, error: &str) -> Result<()> {
    let _ = write_message(
        stream,
        &Message::Error(ErrorMessage {
            error: error.to_string(),
        }),
    )
    .await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{self, CurveTask, TaskRegistry};
    use num_bigint::BigUint;

    fn test_registry(scores: &[(&str, f64)]) -> SharedRegistry {
        registry::shared(TaskRegistry::new(scores.iter().map(|(name, score)| {
            let mut task = CurveTask::new(*name, BigUint::from(101u32));
            task.best_score = *score;
            task
        })))
    }

    #[test]
    fn test_dispatch_fetch_all() {
        let registry = test_registry(&[("A", 40.0), ("B", 12.0)]);

        match dispatch(&registry, Message::FetchAll).unwrap() {
            Message::Tasks(tasks) => {
                assert_eq!(tasks.tasks.len(), 2);
            }
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_dispatch_propose_and_reject() {
        let registry = test_registry(&[("A", 40.0)]);

        let propose = |score: f64, delta: u64| {
            Message::ProposeImprovement(ProposeImprovementMessage {
                name: "A".to_string(),
                observed_best: 40.0,
                candidate_score: score,
                a: BigUint::from(1u32),
                b: BigUint::from(2u32),
                samples_delta: delta,
            })
        };

        match dispatch(&registry, propose(32.0, 10)).unwrap() {
            Message::ProposeOutcome(outcome) => {
                assert!(outcome.accepted);
                assert_eq!(outcome.current_best, 32.0);
            }
            _ => panic!("Wrong message type"),
        }

        // Second propose lost the race; still counted
        match dispatch(&registry, propose(35.0, 7)).unwrap() {
            Message::ProposeOutcome(outcome) => {
                assert!(!outcome.accepted);
                assert_eq!(outcome.current_best, 32.0);
            }
            _ => panic!("Wrong message type"),
        }

        let guard = registry::lock(&registry);
        assert_eq!(guard.get("A").unwrap().samples, 17);
    }

    #[test]
    fn test_dispatch_unknown_task() {
        let registry = test_registry(&[("A", 40.0)]);

        let request = Message::RecordExhausted(RecordExhaustedMessage {
            name: "missing".to_string(),
            samples_delta: 1,
        });

        match dispatch(&registry, request).unwrap() {
            Message::Error(err) => assert!(err.error.contains("unknown task")),
            _ => panic!("Wrong message type"),
        }
    }
}
