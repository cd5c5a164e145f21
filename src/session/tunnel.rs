//! Local port forwards, pumped from the connection worker.

use crate::error::AppResult;
use crate::transport::{RemoteSession, Splice, TunnelSpec};
use std::io::ErrorKind;
use std::net::TcpListener;

struct Forward {
    spec: TunnelSpec,
    listener: Option<TcpListener>,
    splices: Vec<Splice>,
}

pub struct TunnelRuntime {
    connection_id: String,
    forwards: Vec<Forward>,
}

impl TunnelRuntime {
    /// Bind every forward on loopback. A forward whose port is taken is
    /// reported as unbound and skipped; the connection itself stays up.
    pub fn bind(connection_id: &str, specs: &[TunnelSpec]) -> Self {
        let forwards = specs
            .iter()
            .map(|spec| {
                let listener = TcpListener::bind(("127.0.0.1", spec.source_port))
                    .and_then(|listener| {
                        listener.set_nonblocking(true)?;
                        Ok(listener)
                    });
                let listener = match listener {
                    Ok(listener) => Some(listener),
                    Err(e) => {
                        tracing::warn!(
                            "Failed to bind 127.0.0.1:{} for {}:{} (connection {}): {}",
                            spec.source_port,
                            spec.destination_host,
                            spec.destination_port,
                            connection_id,
                            e
                        );
                        None
                    }
                };
                Forward {
                    spec: spec.clone(),
                    listener,
                    splices: Vec::new(),
                }
            })
            .collect();
        Self {
            connection_id: connection_id.to_string(),
            forwards,
        }
    }

    pub fn bound_ports(&self) -> Vec<Option<u16>> {
        self.forwards
            .iter()
            .map(|forward| {
                forward
                    .listener
                    .as_ref()
                    .and_then(|listener| listener.local_addr().ok())
                    .map(|addr| addr.port())
            })
            .collect()
    }

    /// Accept pending local sockets and move bytes once. Only errors that
    /// mean the transport is gone are returned.
    pub fn pump(&mut self, remote: &mut dyn RemoteSession) -> AppResult<bool> {
        let mut progressed = false;
        for forward in &mut self.forwards {
            if let Some(listener) = &forward.listener {
                loop {
                    match listener.accept() {
                        Ok((stream, peer)) => {
                            let channel = match remote
                                .open_tunnel(&forward.spec.destination_host, forward.spec.destination_port)
                            {
                                Ok(channel) => channel,
                                Err(e) if e.is_connection_fatal() => return Err(e),
                                Err(e) => {
                                    tracing::warn!(
                                        "Forward to {}:{} refused for {} (connection {}): {}",
                                        forward.spec.destination_host,
                                        forward.spec.destination_port,
                                        peer,
                                        self.connection_id,
                                        e
                                    );
                                    continue;
                                }
                            };
                            match Splice::new(stream, channel) {
                                Ok(splice) => {
                                    forward.splices.push(splice);
                                    progressed = true;
                                }
                                Err(e) => tracing::warn!("Failed to set up forward socket: {}", e),
                            }
                        }
                        Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                        Err(e) => {
                            tracing::warn!("Accept failed on forward listener: {}", e);
                            break;
                        }
                    }
                }
            }

            for splice in &mut forward.splices {
                match splice.pump() {
                    Ok(moved) => progressed |= moved,
                    Err(e) if e.is_connection_fatal() => return Err(e),
                    Err(e) => {
                        tracing::debug!("Forwarded stream ended: {}", e);
                        splice.close();
                    }
                }
            }
            forward.splices.retain_mut(|splice| {
                if splice.is_finished() {
                    splice.close();
                    false
                } else {
                    true
                }
            });
        }
        Ok(progressed)
    }

    pub fn close(&mut self) {
        for forward in &mut self.forwards {
            for splice in &mut forward.splices {
                splice.close();
            }
            forward.splices.clear();
            forward.listener = None;
        }
    }
}

impl Drop for TunnelRuntime {
    fn drop(&mut self) {
        self.close();
    }
}
