//! Application payload layer.
//!
//! Protocol engines do not know what the bytes they carry mean; the
//! [`AppProtocol`] trait is the seam between the transport machinery and
//! the payload generator of a test case. Implementations are a closed set
//! selected at configuration time through [`AppConfig`].

use std::fmt;

use crate::config::{AppConfig, TestRole};
use crate::stats::GenStats;

/// Outcome of handing received bytes to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivered {
    /// Bytes the application consumed. Anything less than what was offered
    /// means the rest must be re-offered once more data arrives.
    pub consumed: usize,
    /// The application wants to start (or resume) sending.
    pub start_sending: bool,
}

/// Per-connection application state machine. One boxed instance lives on
/// every control block, created when its session is initialized.
pub trait AppProtocol: fmt::Debug {
    /// Connection established. Returns `true` if the application has data
    /// to send right away.
    fn conn_up(&mut self, stats: &mut GenStats) -> bool;

    /// Connection went down; drop any in-flight message state.
    fn conn_down(&mut self, stats: &mut GenStats);

    /// Offers in-order received bytes to the application.
    fn deliver(&mut self, stats: &mut GenStats, bytes: &[u8], rx_tstamp_us: u64) -> Delivered;

    /// Asks the application for its next chunk of at most `max_size`
    /// outbound bytes. `None` means nothing to send right now.
    fn send(&mut self, max_size: usize) -> Option<Vec<u8>>;

    /// Reports how many bytes the transport actually accepted from the
    /// last [`AppProtocol::send`]. Returns `true` when the application has
    /// finished its current message and wants sending to stop.
    fn data_sent(&mut self, stats: &mut GenStats, bytes_sent: usize) -> bool;
}

/// Builds the application instance a new session of this test case runs.
pub fn build(cfg: &AppConfig, role: TestRole) -> Box<dyn AppProtocol> {
    match *cfg {
        AppConfig::Raw { req_size, resp_size } => Box::new(RawApp::new(role, req_size, resp_size)),
    }
}

/// Fixed-size request/response exchange. Clients send `req_size` bytes and
/// wait for `resp_size` bytes back, then start over; servers consume a full
/// request before answering with a response. Payload content is opaque
/// filler.
#[derive(Debug)]
pub struct RawApp {
    role: TestRole,
    req_size: usize,
    resp_size: usize,
    /// Bytes left to send of the current outbound message.
    to_send: usize,
    /// Bytes left to receive of the current inbound message.
    to_recv: usize,
}

impl RawApp {
    /// Creates the app state for one connection.
    pub fn new(role: TestRole, req_size: usize, resp_size: usize) -> RawApp {
        RawApp {
            role,
            req_size,
            resp_size,
            to_send: 0,
            to_recv: 0,
        }
    }

    fn outbound_size(&self) -> usize {
        match self.role {
            TestRole::Client => self.req_size,
            TestRole::Server => self.resp_size,
        }
    }

    fn inbound_size(&self) -> usize {
        match self.role {
            TestRole::Client => self.resp_size,
            TestRole::Server => self.req_size,
        }
    }
}

impl AppProtocol for RawApp {
    fn conn_up(&mut self, _stats: &mut GenStats) -> bool {
        self.to_recv = self.inbound_size();

        match self.role {
            // Clients lead the exchange.
            TestRole::Client => {
                self.to_send = self.outbound_size();
                self.to_send > 0
            }
            // Servers answer only once a full request arrived.
            TestRole::Server => {
                self.to_send = 0;
                false
            }
        }
    }

    fn conn_down(&mut self, _stats: &mut GenStats) {
        self.to_send = 0;
        self.to_recv = 0;
    }

    fn deliver(&mut self, stats: &mut GenStats, bytes: &[u8], _rx_tstamp_us: u64) -> Delivered {
        let consumed = bytes.len().min(self.to_recv);
        self.to_recv -= consumed;
        stats.app_bytes_recv += consumed as u64;

        let mut start_sending = false;
        if consumed > 0 && self.to_recv == 0 {
            // Full message received: expect the next one, and answer (or,
            // for clients, issue the next request).
            self.to_recv = self.inbound_size();
            self.to_send = self.outbound_size();
            start_sending = self.to_send > 0;
        }

        Delivered {
            consumed,
            start_sending,
        }
    }

    fn send(&mut self, max_size: usize) -> Option<Vec<u8>> {
        if self.to_send == 0 || max_size == 0 {
            return None;
        }

        Some(vec![0; self.to_send.min(max_size)])
    }

    fn data_sent(&mut self, stats: &mut GenStats, bytes_sent: usize) -> bool {
        stats.app_bytes_sent += bytes_sent as u64;
        self.to_send = self.to_send.saturating_sub(bytes_sent);
        self.to_send == 0
    }
}
