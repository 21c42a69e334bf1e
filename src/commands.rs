pub mod plan {
    use crate::output;
    use crate::plan::{Command, DeviceCategory, PlanRegistry};

    /// List the commands a poll cycle issues for a device category, in order.
    #[derive(clap::Parser)]
    pub struct Args {
        /// The kind of meter to show the plan for.
        #[arg(long, short = 'd', value_parser = DeviceCategory::parse)]
        device: DeviceCategory,
        #[clap(flatten)]
        output: output::Args,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error(transparent)]
        Plan(#[from] crate::plan::Error),
        #[error("could not output the plan")]
        Output(#[from] output::Error),
    }

    #[derive(serde::Serialize)]
    struct CommandRecord {
        kind: &'static str,
        name: &'static str,
        register: u16,
        count: u16,
        #[serde(skip_serializing_if = "Option::is_none")]
        decoder: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        values: Option<&'static [u16]>,
    }

    impl CommandRecord {
        fn new(command: &Command) -> Self {
            match command {
                Command::Read(read) => CommandRecord {
                    kind: "read",
                    name: read.name,
                    register: read.register,
                    count: read.count,
                    decoder: Some(read.decoder.to_string()),
                    values: None,
                },
                Command::Write(write) => CommandRecord {
                    kind: "write",
                    name: write.name,
                    register: write.register,
                    count: write.values.len() as u16,
                    decoder: None,
                    values: Some(write.values),
                },
            }
        }

        fn table_row(&self) -> Vec<String> {
            let detail = match (&self.decoder, self.values) {
                (Some(decoder), _) => decoder.clone(),
                (None, Some(values)) => format!("{values:04X?}"),
                (None, None) => String::new(),
            };
            vec![
                self.kind.to_string(),
                self.name.to_string(),
                format!("{0} (0x{0:04X})", self.register),
                self.count.to_string(),
                detail,
            ]
        }
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let registry = PlanRegistry::builtin();
        let plan = registry.get(args.device)?;
        let mut output = args.output.to_output()?;
        output.table_headers(vec!["Kind", "Name", "Register", "Count", "Decoder / Values"])?;
        for command in plan.commands() {
            let record = CommandRecord::new(command);
            output.result(|| record.table_row(), || &record)?;
        }
        output.commit()?;
        Ok(())
    }
}

pub mod probe {
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;
    use tracing::{info, warn};

    use crate::connection::{self, Connection};
    use crate::driver::{self, Driver};
    use crate::engine::{Aborted, Cycle, Executor, Outcome};
    use crate::output::{self, Output};
    use crate::plan::{DeviceCategory, PlanRegistry};

    /// Poll a meter over Modbus TCP and print what it reports.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,

        /// The kind of meter being polled.
        #[arg(long, short = 'd', value_parser = DeviceCategory::parse)]
        device: DeviceCategory,

        /// How many poll cycles to run.
        #[arg(long, short = 'n', default_value = "1")]
        cycles: u64,

        /// Poll continuously until interrupted.
        #[arg(long, conflicts_with = "cycles")]
        forever: bool,

        /// The minimum amount of time between the starts of two poll cycles.
        #[arg(long, default_value = "0s")]
        interval: humantime::Duration,

        /// Exit as soon as any poll cycle is aborted instead of starting the next one.
        #[arg(long)]
        stop_on_error: bool,

        #[clap(flatten)]
        output: output::Args,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not start the async runtime")]
        Runtime(#[source] std::io::Error),
        #[error("could not output the readings")]
        Output(#[from] output::Error),
        #[error("polling the meter failed")]
        Poll(#[source] driver::Error<output::Error>),
    }

    #[derive(serde::Serialize)]
    struct ReadingRecord<'a> {
        cycle: u64,
        #[serde(flatten)]
        outcome: &'a Outcome,
    }

    #[derive(serde::Serialize)]
    struct FailureRecord<'a> {
        cycle: u64,
        name: Option<&'static str>,
        error: &'a str,
    }

    /// `error: cause: cause` on a single line.
    fn error_chain(error: &dyn std::error::Error) -> String {
        let mut message = error.to_string();
        let mut cause = error.source();
        while let Some(e) = cause {
            message.push_str(": ");
            message.push_str(&e.to_string());
            cause = e.source();
        }
        message
    }

    fn report(
        output: &mut Output,
        cycle: u64,
        result: &Result<Cycle, Aborted>,
    ) -> Result<(), output::Error> {
        let (outcomes, elapsed) = match result {
            Ok(c) => (&c.outcomes, c.elapsed),
            Err(a) => (&a.completed, a.elapsed),
        };
        for outcome in outcomes {
            output.result(
                || {
                    vec![
                        cycle.to_string(),
                        outcome.name.to_string(),
                        format!("{0} (0x{0:04X})", outcome.register),
                        outcome.kind.to_string(),
                    ]
                },
                || ReadingRecord { cycle, outcome },
            )?;
        }
        if let Err(aborted) = result {
            let name = aborted.error.command();
            let message = error_chain(&aborted.error);
            output.result(
                || {
                    vec![
                        cycle.to_string(),
                        name.unwrap_or_default().to_string(),
                        String::new(),
                        format!("error: {message}"),
                    ]
                },
                || FailureRecord { cycle, name, error: &message },
            )?;
        }
        info!(
            message = "poll cycle finished",
            cycle,
            ok = result.is_ok(),
            elapsed = %humantime::format_duration(elapsed),
        );
        output.flush()
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(Error::Runtime)?;
        runtime.block_on(probe(args))
    }

    async fn probe(args: Args) -> Result<(), Error> {
        let shutdown = CancellationToken::new();
        let _signal_task = tokio_util::task::AbortOnDropHandle::new(tokio::spawn({
            let shutdown = shutdown.clone();
            async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupted, finishing the command in flight");
                    shutdown.cancel();
                }
            }
        }));

        let mut output = args.output.to_output()?;
        output.table_headers(vec!["Cycle", "Command", "Register", "Value"])?;
        let executor = Executor::new(PlanRegistry::builtin()).with_shutdown(shutdown.clone());
        let driver = Driver::new()
            .cycles((!args.forever).then_some(args.cycles))
            .interval(Duration::from(args.interval))
            .stop_on_error(args.stop_on_error)
            .shutdown(shutdown);
        info!(
            message = "polling",
            address = %args.connection.address(),
            device = %args.device,
        );
        let mut connection = Connection::new(args.connection);
        let mut cycle = 0;
        let result = driver
            .run(&executor, args.device, &mut connection, |result| {
                cycle += 1;
                report(&mut output, cycle, result)
            })
            .await;
        match result {
            Ok(_) => {}
            Err(driver::Error::Report(e)) => return Err(Error::Output(e)),
            Err(e) => {
                output.commit()?;
                return Err(Error::Poll(e));
            }
        }
        output.commit()?;
        Ok(())
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::decode::Value;
        use crate::engine::{self, OutcomeKind};
        use clap::Parser as _;

        #[test]
        fn arguments() {
            let args =
                Args::try_parse_from(["probe", "--tcp", "10.0.0.7", "-i", "3", "-d", "schneider"])
                    .unwrap();
            assert_eq!(args.device, DeviceCategory::Schneider);
            assert_eq!(args.cycles, 1);
            assert!(!args.forever);
            assert_eq!(args.connection.address(), "10.0.0.7:502");

            let args = Args::try_parse_from([
                "probe", "--tcp", "meter:1502", "-d", "abb", "--forever", "--interval", "5s",
            ])
            .unwrap();
            assert!(args.forever);
            assert_eq!(Duration::from(args.interval), Duration::from_secs(5));
            assert_eq!(args.connection.address(), "meter:1502");

            assert!(Args::try_parse_from(["probe", "--tcp", "meter", "-d", "acme"]).is_err());
            assert!(
                Args::try_parse_from(["probe", "--tcp", "m", "-d", "abb", "-n", "2", "--forever"])
                    .is_err()
            );
        }

        fn aborted_cycle() -> Result<Cycle, Aborted> {
            Err(Aborted {
                category: DeviceCategory::Abb,
                completed: vec![Outcome {
                    name: "Serial number",
                    register: 0x8900,
                    kind: OutcomeKind::Read(Value::U32(42)),
                }],
                elapsed: Duration::from_millis(5),
                error: engine::Error::Read {
                    name: "Active power",
                    source: connection::Error::ReadTimeout(Duration::from_secs(1).into()),
                },
            })
        }

        const FAILURE: &str = "error: could not read `Active power`: no response received within 1s";

        #[test]
        fn aborted_cycle_csv_rows() {
            let (mut output, buffer) = output::in_memory(output::Format::Csv);
            output.table_headers(vec!["Cycle", "Command", "Register", "Value"]).unwrap();
            report(&mut output, 1, &aborted_cycle()).unwrap();
            let text = String::from_utf8(buffer.take()).unwrap();
            let lines = text.lines().collect::<Vec<_>>();
            assert_eq!(lines.len(), 3, "{text}");
            assert_eq!(lines[0], "Cycle,Command,Register,Value");
            assert_eq!(lines[1], "1,Serial number,35072 (0x8900),42");
            assert!(lines[2].starts_with("1,Active power,"), "{}", lines[2]);
            assert!(lines[2].ends_with(&format!(",{FAILURE}")), "{}", lines[2]);
        }

        #[test]
        fn aborted_cycle_jsonl_records() {
            let (mut output, buffer) = output::in_memory(output::Format::Jsonl);
            report(&mut output, 3, &aborted_cycle()).unwrap();
            let text = String::from_utf8(buffer.take()).unwrap();
            let records = text
                .lines()
                .map(|line| serde_json::from_str::<serde_json::Value>(line).unwrap())
                .collect::<Vec<_>>();
            assert_eq!(
                records,
                [
                    serde_json::json!({
                        "cycle": 3, "name": "Serial number", "register": 35072, "read": 42
                    }),
                    serde_json::json!({
                        "cycle": 3,
                        "name": "Active power",
                        "error": FAILURE.trim_start_matches("error: "),
                    }),
                ]
            );
        }

        #[test]
        fn each_cycle_prints_its_own_table() {
            let (mut output, buffer) = output::in_memory(output::Format::Table);
            output.table_headers(vec!["Cycle", "Command", "Register", "Value"]).unwrap();
            report(&mut output, 1, &aborted_cycle()).unwrap();
            let first = String::from_utf8(buffer.take()).unwrap();
            assert!(first.contains("Serial number"), "{first}");
            assert!(first.contains("Active power"), "{first}");
            report(&mut output, 2, &aborted_cycle()).unwrap();
            let second = String::from_utf8(buffer.take()).unwrap();
            assert_eq!(second.matches("Cycle").count(), 1, "{second}");
            assert!(second.contains("Serial number"), "{second}");
        }

        #[test]
        fn error_chain_is_one_line() {
            let error = engine::Error::Read {
                name: "Tariff",
                source: connection::Error::Exception(2),
            };
            let message = error_chain(&error);
            assert!(message.starts_with("could not read `Tariff`: "));
            assert!(!message.contains('\n'));
        }
    }
}
