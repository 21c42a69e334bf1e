//! Execution of a plan against a meter, one command at a time.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::connection;
use crate::decode::{self, Value};
use crate::plan::{self, Command, DeviceCategory, Plan, PlanRegistry};

/// The register operations a meter connection must provide.
///
/// Methods take `&mut self`: a connection serves one cycle at a time, and a request must
/// complete (successfully or not) before the next one is issued.
#[allow(async_fn_in_trait)]
pub trait Client {
    async fn read(&mut self, register: u16, count: u16) -> Result<Vec<u16>, connection::Error>;
    async fn write(&mut self, register: u16, values: &[u16]) -> Result<(), connection::Error>;
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Plan(#[from] plan::Error),
    #[error("could not read `{name}`")]
    Read {
        name: &'static str,
        #[source]
        source: connection::Error,
    },
    #[error("could not decode `{name}`")]
    Decode {
        name: &'static str,
        #[source]
        source: decode::Error,
    },
    #[error("could not write `{name}`")]
    Write {
        name: &'static str,
        #[source]
        source: connection::Error,
    },
    #[error("interrupted before `{next}`")]
    Interrupted { next: &'static str },
}

impl Error {
    /// The name of the command this error is attributed to.
    pub fn command(&self) -> Option<&'static str> {
        match self {
            Error::Plan(_) => None,
            Error::Read { name, .. } | Error::Decode { name, .. } | Error::Write { name, .. } => {
                Some(*name)
            }
            Error::Interrupted { next } => Some(*next),
        }
    }
}

#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct Outcome {
    pub name: &'static str,
    pub register: u16,
    #[serde(flatten)]
    pub kind: OutcomeKind,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Read(Value),
    Wrote(&'static [u16]),
}

impl std::fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutcomeKind::Read(value) => value.fmt(f),
            OutcomeKind::Wrote(values) => f.write_fmt(format_args!("wrote {values:04X?}")),
        }
    }
}

/// A plan that ran to completion.
#[derive(Debug)]
pub struct Cycle {
    pub category: DeviceCategory,
    pub outcomes: Vec<Outcome>,
    pub elapsed: Duration,
}

/// A plan that stopped at its first failing command.
///
/// `completed` holds the outcomes of every command before the failing one.
#[derive(thiserror::Error, Debug)]
#[error("the {category} poll cycle was aborted after {} commands", .completed.len())]
pub struct Aborted {
    pub category: DeviceCategory,
    pub completed: Vec<Outcome>,
    pub elapsed: Duration,
    #[source]
    pub error: Error,
}

pub struct Executor {
    registry: PlanRegistry,
    shutdown: CancellationToken,
}

impl Executor {
    pub fn new(registry: PlanRegistry) -> Self {
        Self { registry, shutdown: CancellationToken::new() }
    }

    /// Stop executing plans at the next command boundary once `shutdown` is cancelled.
    ///
    /// A command that is already in flight is always allowed to finish.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Run the plan for `category` once, start to finish.
    pub async fn run_cycle<C: Client>(
        &self,
        category: DeviceCategory,
        client: &mut C,
    ) -> Result<Cycle, Aborted> {
        let plan = self.registry.get(category).map_err(|e| Aborted {
            category,
            completed: Vec::new(),
            elapsed: Duration::ZERO,
            error: e.into(),
        })?;
        self.execute(plan, client).await
    }

    pub async fn execute<C: Client>(&self, plan: &Plan, client: &mut C) -> Result<Cycle, Aborted> {
        let category = plan.category();
        info!(message = "reading", device = %category);
        let start = Instant::now();
        let mut outcomes = Vec::with_capacity(plan.commands().len());
        for command in plan.commands() {
            let result = if self.shutdown.is_cancelled() {
                Err(Error::Interrupted { next: command.name() })
            } else {
                execute_command(command, client).await
            };
            match result {
                Ok(outcome) => {
                    match &outcome.kind {
                        OutcomeKind::Read(value) => {
                            info!(message = "read", command = outcome.name, %value)
                        }
                        OutcomeKind::Wrote(values) => {
                            info!(message = "wrote", command = outcome.name, ?values)
                        }
                    }
                    outcomes.push(outcome);
                }
                Err(error) => {
                    error!(
                        message = "command failed, aborting the cycle",
                        command = command.name(),
                        register = command.register(),
                        error = (&error as &dyn std::error::Error)
                    );
                    let elapsed = start.elapsed();
                    return Err(Aborted { category, completed: outcomes, elapsed, error });
                }
            }
        }
        let elapsed = start.elapsed();
        info!(message = "cycle finished", device = %category, took = ?elapsed);
        Ok(Cycle { category, outcomes, elapsed })
    }
}

async fn execute_command<C: Client>(command: &Command, client: &mut C) -> Result<Outcome, Error> {
    match command {
        Command::Read(read) => {
            let words = client
                .read(read.register, read.count)
                .await
                .map_err(|source| Error::Read { name: read.name, source })?;
            let value =
                read.decode(&words).map_err(|source| Error::Decode { name: read.name, source })?;
            Ok(Outcome { name: read.name, register: read.register, kind: OutcomeKind::Read(value) })
        }
        Command::Write(write) => {
            client
                .write(write.register, write.values)
                .await
                .map_err(|source| Error::Write { name: write.name, source })?;
            Ok(Outcome {
                name: write.name,
                register: write.register,
                kind: OutcomeKind::Wrote(write.values),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::Decoder;
    use crate::plan::{ABB, SCHNEIDER};
    use crate::testing::{Call, EchoClient, ScriptedClient};

    static MIXED: [Command; 3] = [
        Command::read("Counter", 0x10, 2, Decoder::U32),
        Command::write("Select", 0x20, &[1]),
        Command::read("Selected", 0x20, 1, Decoder::RawBytes),
    ];

    static FIVE_READS: [Command; 5] = [
        Command::read("First", 0x01, 1, Decoder::U16),
        Command::read("Second", 0x02, 1, Decoder::U16),
        Command::read("Third", 0x03, 1, Decoder::U16),
        Command::read("Fourth", 0x04, 1, Decoder::U16),
        Command::read("Fifth", 0x05, 1, Decoder::U16),
    ];

    fn executor() -> Executor {
        Executor::new(PlanRegistry::builtin())
    }

    #[tokio::test]
    async fn read_write_read() {
        let plan = Plan::new(DeviceCategory::Abb, &MIXED);
        let mut client = ScriptedClient::new([Ok(vec![0x0000, 0x0001]), Ok(vec![]), Ok(vec![0x0001])]);
        let cycle = executor().execute(&plan, &mut client).await.unwrap();
        let kinds = cycle.outcomes.into_iter().map(|o| o.kind).collect::<Vec<_>>();
        assert_eq!(
            kinds,
            [
                OutcomeKind::Read(Value::U32(1)),
                OutcomeKind::Wrote(&[1]),
                OutcomeKind::Read(Value::Bytes(vec![0x00, 0x01])),
            ]
        );
        assert_eq!(
            client.calls,
            [
                Call::Read { register: 0x10, count: 2 },
                Call::Write { register: 0x20, values: vec![1] },
                Call::Read { register: 0x20, count: 1 },
            ]
        );
    }

    #[tokio::test]
    async fn failure_stops_the_cycle() {
        let plan = Plan::new(DeviceCategory::Abb, &FIVE_READS);
        let mut client = ScriptedClient::new([
            Ok(vec![1]),
            Ok(vec![2]),
            Err(connection::Error::Exception(2)),
            Ok(vec![4]),
            Ok(vec![5]),
        ]);
        let aborted = executor().execute(&plan, &mut client).await.unwrap_err();
        let names = aborted.completed.iter().map(|o| o.name).collect::<Vec<_>>();
        assert_eq!(names, ["First", "Second"]);
        assert_eq!(aborted.error.command(), Some("Third"));
        assert!(matches!(
            aborted.error,
            Error::Read { source: connection::Error::Exception(2), .. }
        ));
        assert_eq!(client.calls.len(), 3);
    }

    #[tokio::test]
    async fn decode_failure_stops_the_cycle() {
        let plan = Plan::new(DeviceCategory::Abb, &MIXED);
        let mut client = ScriptedClient::new([Ok(vec![0x0001]), Ok(vec![]), Ok(vec![0x0001])]);
        let aborted = executor().execute(&plan, &mut client).await.unwrap_err();
        assert!(aborted.completed.is_empty());
        assert!(matches!(
            aborted.error,
            Error::Decode {
                name: "Counter",
                source: decode::Error::SizeMismatch { expected: 2, actual: 1 }
            }
        ));
        assert_eq!(client.calls, [Call::Read { register: 0x10, count: 2 }]);
    }

    #[tokio::test]
    async fn write_failure_stops_the_cycle() {
        let plan = Plan::new(DeviceCategory::Abb, &MIXED);
        let mut client =
            ScriptedClient::new([Ok(vec![0, 7]), Err(connection::Error::SendTimeout)]);
        let aborted = executor().execute(&plan, &mut client).await.unwrap_err();
        assert_eq!(aborted.completed.len(), 1);
        assert!(matches!(aborted.error, Error::Write { name: "Select", .. }));
        assert_eq!(client.calls.len(), 2);
    }

    #[tokio::test]
    async fn tariff_selection_is_read_back() {
        let mut client = EchoClient::default();
        let cycle = executor().run_cycle(DeviceCategory::Schneider, &mut client).await.unwrap();
        assert_eq!(cycle.outcomes.len(), SCHNEIDER.commands().len());
        let tariffs = cycle
            .outcomes
            .iter()
            .filter(|o| o.name == "Tariff")
            .map(|o| o.kind.clone())
            .collect::<Vec<_>>();
        assert_eq!(
            tariffs,
            [
                OutcomeKind::Read(Value::Bytes(vec![0x00, 0x01])),
                OutcomeKind::Read(Value::Bytes(vec![0x00, 0x02])),
            ]
        );
        assert_eq!(client.registers.get(&0x105E), Some(&0x0002));
    }

    #[tokio::test]
    async fn unsupported_device() {
        let executor = Executor::new(PlanRegistry::new().with(ABB));
        let mut client = EchoClient::default();
        let aborted = executor.run_cycle(DeviceCategory::Schneider, &mut client).await.unwrap_err();
        assert!(matches!(aborted.error, Error::Plan(plan::Error::UnsupportedDevice(_))));
        assert!(aborted.completed.is_empty());
        assert!(client.calls.is_empty());
    }

    #[tokio::test]
    async fn shutdown_between_commands() {
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let executor = executor().with_shutdown(shutdown);
        let mut client = EchoClient::default();
        let aborted = executor.run_cycle(DeviceCategory::Abb, &mut client).await.unwrap_err();
        assert!(matches!(aborted.error, Error::Interrupted { next: "Type designation" }));
        assert!(client.calls.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cycle_duration() {
        let plan = Plan::new(DeviceCategory::Abb, &MIXED);
        let mut client = EchoClient { delay: Duration::from_millis(100), ..Default::default() };
        let cycle = executor().execute(&plan, &mut client).await.unwrap();
        assert!(cycle.elapsed >= Duration::from_millis(300), "{:?}", cycle.elapsed);
        assert_eq!(cycle.outcomes[2].kind, OutcomeKind::Read(Value::Bytes(vec![0x00, 0x01])));
    }

    #[test]
    fn outcome_serialization() {
        let outcome = Outcome {
            name: "Serial number",
            register: 0x8900,
            kind: OutcomeKind::Read(Value::U32(12345)),
        };
        assert_eq!(
            serde_json::to_string(&outcome).unwrap(),
            r#"{"name":"Serial number","register":35072,"read":12345}"#
        );
        assert_eq!(OutcomeKind::Wrote(&[1]).to_string(), "wrote [0001]");
    }
}
