// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Routes inbound connections to their sessions. The dispatcher owns
//! the listen loop and nothing else; whether a connection is welcome is
//! the session's call.

use crate::connection::{BgpConnection, BgpListener};
use crate::session::Session;
use crate::to_canonical;
use gt_common::lock;
use slog::{debug, error, warn, Logger};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub struct Dispatcher<Cnx: BgpConnection> {
    pub addr_to_session: Arc<Mutex<BTreeMap<IpAddr, Arc<Session<Cnx>>>>>,
    shutdown: AtomicBool,
    listen: String,
    log: Logger,
}

impl<Cnx: BgpConnection> Dispatcher<Cnx> {
    pub fn new(
        addr_to_session: Arc<Mutex<BTreeMap<IpAddr, Arc<Session<Cnx>>>>>,
        listen: String,
        log: Logger,
    ) -> Self {
        Self {
            addr_to_session,
            listen,
            log,
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn run<Listener: BgpListener<Cnx>>(&self) {
        let listener = match Listener::bind(&self.listen) {
            Ok(l) => l,
            Err(e) => {
                error!(self.log, "bgp dispatcher failed to listen: {e}");
                return;
            }
        };
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                self.shutdown.store(false, Ordering::Release);
                break;
            }
            let conn = match listener
                .accept(self.log.clone(), Duration::from_millis(100))
            {
                Ok(c) => c,
                Err(crate::error::Error::Timeout) => continue,
                Err(e) => {
                    debug!(self.log, "accept: {e}");
                    continue;
                }
            };
            let addr = to_canonical(conn.peer().ip());
            let session = lock!(self.addr_to_session).get(&addr).cloned();
            match session {
                Some(session) => {
                    if let Err(e) = session.inbound(conn) {
                        debug!(self.log, "inbound from {addr} refused: {e}");
                    }
                }
                None => {
                    warn!(
                        self.log,
                        "connection attempt from unknown peer {addr}"
                    );
                    conn.close();
                }
            }
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }
}
