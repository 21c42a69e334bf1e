//! Test doubles standing in for a meter connection.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use crate::connection;
use crate::engine::Client;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    Read { register: u16, count: u16 },
    Write { register: u16, values: Vec<u16> },
}

/// Answers each request with the next reply in line, whatever was asked for.
///
/// A write succeeds if its reply is `Ok`; the words are ignored. Runs out with `Closed`.
#[derive(Default)]
pub struct ScriptedClient {
    replies: VecDeque<Result<Vec<u16>, connection::Error>>,
    pub calls: Vec<Call>,
}

impl ScriptedClient {
    pub fn new(replies: impl IntoIterator<Item = Result<Vec<u16>, connection::Error>>) -> Self {
        Self { replies: replies.into_iter().collect(), calls: Vec::new() }
    }

    fn next_reply(&mut self) -> Result<Vec<u16>, connection::Error> {
        self.replies.pop_front().unwrap_or(Err(connection::Error::Closed))
    }
}

impl Client for ScriptedClient {
    async fn read(&mut self, register: u16, count: u16) -> Result<Vec<u16>, connection::Error> {
        self.calls.push(Call::Read { register, count });
        self.next_reply()
    }

    async fn write(&mut self, register: u16, values: &[u16]) -> Result<(), connection::Error> {
        self.calls.push(Call::Write { register, values: values.to_vec() });
        self.next_reply().map(drop)
    }
}

/// A register bank: reads return whatever was last written, or zero.
#[derive(Default)]
pub struct EchoClient {
    pub registers: BTreeMap<u16, u16>,
    pub calls: Vec<Call>,
    /// How long each request takes.
    pub delay: Duration,
}

impl EchoClient {
    async fn pace(&self) {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
    }
}

impl Client for EchoClient {
    async fn read(&mut self, register: u16, count: u16) -> Result<Vec<u16>, connection::Error> {
        self.calls.push(Call::Read { register, count });
        self.pace().await;
        Ok((0..count)
            .map(|offset| self.registers.get(&register.wrapping_add(offset)).copied().unwrap_or(0))
            .collect())
    }

    async fn write(&mut self, register: u16, values: &[u16]) -> Result<(), connection::Error> {
        self.calls.push(Call::Write { register, values: values.to_vec() });
        self.pace().await;
        for (offset, value) in (0..).zip(values) {
            self.registers.insert(register.wrapping_add(offset), *value);
        }
        Ok(())
    }
}
