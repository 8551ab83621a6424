//! Length-prefixed JSON frames over a byte stream pair, normally the host
//! process's stdin and stdout. Each request frame is answered by exactly one
//! response frame; shutdown frames are not answered.

use crate::config::SessionConfig;
use crate::connection::{OutboundRequest, Reply, SendMode, TransportAdapter, TransportFailure};
use crate::protocol::{read_frame, write_frame};
use std::io::{self, Read, Write};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, warn};

pub struct StdioTransport {
    outbound: Option<Sender<Vec<u8>>>,
    inbound: Receiver<Reply>,
    writer: Option<JoinHandle<io::Result<()>>>,
    reader: Option<JoinHandle<io::Result<()>>>,
}

impl StdioTransport {
    pub fn spawn(config: &SessionConfig) -> Self {
        Self::with_streams(
            io::stdin(),
            io::stdout(),
            config.max_inbound_frame,
            config.max_outbound_frame,
        )
    }

    pub fn with_streams<R, W>(
        reader: R,
        writer: W,
        max_inbound_frame: usize,
        max_outbound_frame: usize,
    ) -> Self
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let (outbound_tx, outbound_rx) = mpsc::channel::<Vec<u8>>();
        let (inbound_tx, inbound_rx) = mpsc::channel::<Reply>();

        let writer_handle =
            thread::spawn(move || writer_loop(writer, outbound_rx, max_outbound_frame));
        let reader_handle = thread::spawn(move || {
            let result = reader_loop(reader, max_inbound_frame, |reply| {
                let _ = inbound_tx.send(reply);
            });
            if let Err(err) = &result {
                error!(error = %err, "reader loop terminated with error");
            }
            result
        });

        Self {
            outbound: Some(outbound_tx),
            inbound: inbound_rx,
            writer: Some(writer_handle),
            reader: Some(reader_handle),
        }
    }

    /// Next reply that arrived for an asynchronous request, if any.
    pub fn poll(&self) -> Option<Reply> {
        self.inbound.try_recv().ok()
    }

    /// Closes the outbound stream and joins threads that have already
    /// finished. A thread still blocked on stdio is left behind.
    pub fn shutdown(&mut self) {
        self.outbound = None;

        for (name, handle) in [("writer", self.writer.take()), ("reader", self.reader.take())] {
            let Some(handle) = handle else {
                continue;
            };
            if !handle.is_finished() {
                warn!(thread = name, "thread still active during shutdown; skipping join");
                continue;
            }
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(thread = name, error = %err, "thread returned error"),
                Err(err) => warn!(thread = name, error = ?err, "thread join failed"),
            }
        }
    }

    fn queue(&self, request: &OutboundRequest) -> bool {
        match &self.outbound {
            Some(tx) => tx.send(request.payload.clone()).is_ok(),
            None => false,
        }
    }
}

impl TransportAdapter for StdioTransport {
    fn transmit(&mut self, request: &OutboundRequest, mode: SendMode) -> Option<Reply> {
        debug!(
            request_counter = request.request_counter,
            url = %request.url,
            ?mode,
            "queueing request frame"
        );
        if !self.queue(request) {
            return match mode {
                SendMode::Beacon => None,
                SendMode::Async | SendMode::Sync => Some(Err(TransportFailure::connectivity())),
            };
        }

        match mode {
            SendMode::Async | SendMode::Beacon => None,
            SendMode::Sync => Some(
                self.inbound
                    .recv()
                    .unwrap_or_else(|_| Err(TransportFailure::connectivity())),
            ),
        }
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn writer_loop<W: Write>(mut writer: W, rx: Receiver<Vec<u8>>, max_payload: usize) -> io::Result<()> {
    for payload in rx {
        write_frame(&mut writer, &payload, max_payload)?;
        writer.flush()?;
    }

    Ok(())
}

fn reader_loop<R, F>(mut reader: R, max_payload: usize, mut on_reply: F) -> io::Result<()>
where
    R: Read,
    F: FnMut(Reply),
{
    loop {
        match read_frame(&mut reader, max_payload) {
            Ok(payload) => on_reply(Ok(payload)),
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                on_reply(Err(TransportFailure::connectivity()));
                return Ok(());
            }
            Err(err) if err.kind() == io::ErrorKind::InvalidData => {
                on_reply(Err(TransportFailure::application(413, err.to_string())));
                return Err(err);
            }
            Err(err) => {
                on_reply(Err(TransportFailure::connectivity()));
                return Err(err);
            }
        }
    }
}
