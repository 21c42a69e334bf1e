use crate::engine::Client;
use crate::modbus::{ModbusTCPCodec, Operation, Request, Response, ResponseKind};
use futures::{SinkExt, StreamExt as _};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, info, trace, warn};

pub const DEFAULT_PORT: u16 = 502;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("lookup of `{1}` failed")]
    LookupHost(#[source] std::io::Error, String),
    #[error("could not connect to `{1}` over TCP")]
    Connect(#[source] std::io::Error, String),
    #[error("connecting to `{0}` timed out")]
    ConnectTimeout(String),
    #[error("could not read data from the stream")]
    Receive(#[source] std::io::Error),
    #[error("could not send out the request")]
    Send(#[source] std::io::Error),
    #[error("sending the request timed out")]
    SendTimeout,
    #[error("no response received within {0}")]
    ReadTimeout(humantime::Duration),
    #[error("the connection was closed by the device")]
    Closed,
    #[error("the device responded with exception code {0}")]
    Exception(u8),
    #[error("the device sent a malformed response (function code {0:#04x})")]
    Malformed(u8),
    #[error("the response does not match the request")]
    Mismatched,
    #[error("expected {expected} registers in the response, got {actual}")]
    ResponseIncomplete { expected: u16, actual: usize },
    #[error("the connection worker has stopped")]
    WorkerGone,
}

#[derive(clap::Parser, Clone)]
#[group(id = "connection::Args")]
pub struct Args {
    /// Connect to the meter's Modbus TCP gateway at `host[:port]`.
    ///
    /// The port defaults to 502.
    #[arg(long)]
    tcp: String,

    /// The modbus unit (slave) ID of the meter behind the gateway.
    #[arg(long, short = 'i', default_value = "0")]
    unit_id: u8,

    /// If the modbus response isn't received in this amount of time, consider the request failed
    /// and reconnect before the next one.
    #[arg(long, default_value = "1s")]
    read_timeout: humantime::Duration,

    /// Give up on connecting or sending a request after this amount of time.
    #[arg(long, default_value = "3s")]
    send_timeout: humantime::Duration,

    /// Retry timed out requests and `Server Busy` exceptions this many times.
    ///
    /// Any other failure is reported straight away.
    #[arg(long, default_value = "0")]
    retries: usize,

    /// The minimum amount of time between sending out subsequent requests.
    ///
    /// Interacting too fast can make some Modbus TCP gateways behave poorly.
    #[arg(long, default_value = "0ms")]
    tcp_send_delay: humantime::Duration,

    /// The amount of time to wait after receiving a server busy exception before retrying.
    #[arg(long, default_value = "25ms")]
    server_busy_retry_delay: humantime::Duration,
}

impl Args {
    /// The `host:port` to connect to.
    pub fn address(&self) -> String {
        match self.tcp.parse::<IpAddr>() {
            Ok(IpAddr::V4(ip)) => format!("{ip}:{DEFAULT_PORT}"),
            Ok(IpAddr::V6(ip)) => format!("[{ip}]:{DEFAULT_PORT}"),
            Err(_) if self.tcp.contains(':') => self.tcp.clone(),
            Err(_) => format!("{}:{DEFAULT_PORT}", self.tcp),
        }
    }
}

struct Job {
    request: Request,
    reply: oneshot::Sender<Result<Response, Error>>,
}

/// A Modbus TCP session with a single meter.
///
/// Requests are handed to a worker task owning the socket, which processes them one at a time
/// in the order they were sent.
pub struct Connection {
    request_queue: UnboundedSender<Job>,
    #[allow(unused)] // exists for its drop handler
    worker: AbortOnDropHandle<()>,
    transaction_id_generator: AtomicU16,
    args: Args,
}

impl Connection {
    /// The connection is established lazily, when the first request is sent.
    pub fn new(args: Args) -> Connection {
        let (request_queue, jobs) = tokio::sync::mpsc::unbounded_channel();
        let worker = TcpWorker { args: args.clone(), io: None, last_send: None }.spawn(jobs);
        Self { request_queue, worker, transaction_id_generator: AtomicU16::new(0), args }
    }

    pub fn new_transaction_id(&self) -> u16 {
        self.transaction_id_generator.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn send(&self, operation: Operation) -> Result<Response, Error> {
        let transaction_id = self.new_transaction_id();
        let request = Request { unit_id: self.args.unit_id, transaction_id, operation };
        let (reply, response) = oneshot::channel();
        self.request_queue.send(Job { request, reply }).map_err(|_| Error::WorkerGone)?;
        response.await.map_err(|_| Error::WorkerGone)?
    }

    /// [`Self::send`] but retries timeouts and `Server Busy` exceptions.
    pub async fn send_retrying(&self, operation: Operation) -> Result<Response, Error> {
        let mut retries = self.args.retries;
        loop {
            let result = self.send(operation.clone()).await;
            let busy = matches!(&result, Ok(response) if response.is_server_busy());
            let timed_out = matches!(&result, Err(Error::ReadTimeout(_) | Error::SendTimeout));
            if !(busy || timed_out) || retries == 0 {
                return result;
            }
            retries -= 1;
            debug!(message = "retrying the request", busy, retries_left = retries);
            if busy {
                self.handle_server_busy().await;
            }
        }
    }

    pub async fn handle_server_busy(&self) {
        tokio::time::sleep(*self.args.server_busy_retry_delay).await;
    }
}

impl Client for Connection {
    async fn read(&mut self, register: u16, count: u16) -> Result<Vec<u16>, Error> {
        let operation = Operation::GetHoldings { address: register, count };
        match self.send_retrying(operation).await?.kind {
            ResponseKind::GetHoldings { values } if values.len() == usize::from(count) => Ok(values),
            ResponseKind::GetHoldings { values } => {
                Err(Error::ResponseIncomplete { expected: count, actual: values.len() })
            }
            ResponseKind::ErrorCode(code) => Err(Error::Exception(code)),
            ResponseKind::Malformed { function_code } => Err(Error::Malformed(function_code)),
            ResponseKind::SetHoldings { .. } => Err(Error::Mismatched),
        }
    }

    async fn write(&mut self, register: u16, values: &[u16]) -> Result<(), Error> {
        let operation = Operation::SetHoldings { address: register, values: values.to_vec() };
        match self.send_retrying(operation).await?.kind {
            ResponseKind::SetHoldings { address, count }
                if address == register && usize::from(count) == values.len() =>
            {
                Ok(())
            }
            ResponseKind::ErrorCode(code) => Err(Error::Exception(code)),
            ResponseKind::Malformed { function_code } => Err(Error::Malformed(function_code)),
            ResponseKind::SetHoldings { .. } | ResponseKind::GetHoldings { .. } => {
                Err(Error::Mismatched)
            }
        }
    }
}

type TcpIo = Framed<TcpStream, ModbusTCPCodec>;

struct TcpWorker {
    args: Args,
    /// `None` until connected, and again after any failure so that the next request reconnects.
    io: Option<TcpIo>,
    last_send: Option<Instant>,
}

impl TcpWorker {
    fn spawn(self, jobs: UnboundedReceiver<Job>) -> AbortOnDropHandle<()> {
        AbortOnDropHandle::new(tokio::task::spawn(self.main_loop(jobs)))
    }

    async fn main_loop(mut self, mut jobs: UnboundedReceiver<Job>) {
        while let Some(Job { request, reply }) = jobs.recv().await {
            let result = self.exchange(&request).await;
            if let Err(e) = &result {
                warn!(
                    message = "request failed, will reconnect",
                    transaction = request.transaction_id,
                    error = (e as &dyn std::error::Error)
                );
            }
            if reply.send(result).is_err() {
                let transaction = request.transaction_id;
                debug!(message = "nobody is waiting for the response", transaction);
            }
        }
        if let Some(mut io) = self.io.take() {
            let close_result = SinkExt::<&Request>::close(&mut io).await;
            trace!(message = "closing the connection", is_error = ?close_result.err());
        }
    }

    async fn exchange(&mut self, request: &Request) -> Result<Response, Error> {
        let mut io = match self.io.take() {
            Some(io) => io,
            None => self.connect().await?,
        };
        if let Some(last_send) = self.last_send {
            tokio::time::sleep_until(last_send + *self.args.tcp_send_delay).await;
        }
        self.last_send = Some(Instant::now());
        let response = self.round_trip(&mut io, request).await?;
        self.io = Some(io);
        Ok(response)
    }

    async fn round_trip(&self, io: &mut TcpIo, request: &Request) -> Result<Response, Error> {
        tokio::time::timeout(*self.args.send_timeout, io.send(request))
            .await
            .map_err(|_| Error::SendTimeout)?
            .map_err(Error::Send)?;
        let deadline = Instant::now() + *self.args.read_timeout;
        loop {
            let next = tokio::time::timeout_at(deadline, io.next())
                .await
                .map_err(|_| Error::ReadTimeout((*self.args.read_timeout).into()))?;
            let response = match next {
                None => return Err(Error::Closed),
                Some(response) => response.map_err(Error::Receive)?,
            };
            if response.transaction_id != request.transaction_id {
                // Most likely a late answer to a request that has already timed out.
                debug!(
                    message = "a response we were not expecting",
                    transaction = response.transaction_id,
                    expected = request.transaction_id
                );
                continue;
            }
            trace!(message = "received a response", transaction = response.transaction_id);
            return Ok(response);
        }
    }

    async fn connect(&self) -> Result<TcpIo, Error> {
        let address = self.args.address();
        info!(message = "connecting...", %address);
        let addresses = tokio::net::lookup_host(&address)
            .await
            .map_err(|e| Error::LookupHost(e, address.clone()))?
            .collect::<Vec<_>>();
        debug!(message = "resolved", ?addresses);
        let socket = tokio::time::timeout(*self.args.send_timeout, TcpStream::connect(&*addresses))
            .await
            .map_err(|_| Error::ConnectTimeout(address.clone()))?
            .map_err(|e| Error::Connect(e, address.clone()))?;
        let nodelay_result = socket.set_nodelay(true);
        trace!(message = "setting nodelay", is_error = ?nodelay_result.err());
        info!(message = "connected");
        Ok(Framed::new(socket, ModbusTCPCodec {}))
    }
}
