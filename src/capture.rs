//! Capture sources and the windowed capture loop.
//!
//! An [`Engine`] owns up to ten capture sources and drives them in
//! 60-second wall-aligned measurement windows. A source whose name is an
//! existing file is replayed offline (and must then be the only source);
//! anything else is opened live with a fixed 64 KiB snap length in
//! non-blocking mode. Each [`Engine::run`] call processes one window and
//! ends it by snapshotting kernel statistics (live mode) and expiring idle
//! TCP flows.

use crate::demux::{DatalinkType, Demux};
use crate::indexer::InterfaceNameIndexer;
use crate::tcp::MAX_TCP_IDLE;
use crate::transport::DnsHandler;
use crate::{CaptureError, time};
use log::{debug, error};
use pcap::{Active, Capture, Offline};
use serde::Serialize;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;

/// Bytes copied per frame from the kernel.
const PCAP_SNAPLEN: i32 = 65536;
const MAX_INTERFACES: usize = 10;
/// Measurement window length, seconds.
const INTERVAL: i64 = 60;
const SELECT_TIMEOUT_USEC: i64 = 250_000;

enum CaptureHandle {
    Live { capture: Capture<Active>, fd: RawFd },
    Offline(Capture<Offline>),
}

#[derive(Debug, Clone, Copy, Default)]
struct StatSnapshot {
    received: u32,
    dropped: u32,
}

/// One capture source and its per-window counters.
pub struct Interface {
    device: String,
    handle: CaptureHandle,
    datalink: DatalinkType,
    ps0: StatSnapshot,
    ps1: StatSnapshot,
    pkts_captured: u64,
}

impl Interface {
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Frames delivered to the handler during the current window.
    pub fn pkts_captured(&self) -> u64 {
        self.pkts_captured
    }
}

/// Per-interface counters for one capture window.
#[derive(Debug, Clone, Serialize)]
pub struct InterfaceStats {
    pub ifname: String,
    /// Frames delivered to the handler.
    pub pkts_captured: u64,
    /// Kernel-side received delta across the window.
    pub filter_received: u32,
    /// Kernel-side drop delta across the window.
    pub kernel_dropped: u32,
}

/// The windowed capture orchestrator.
pub struct Engine {
    interfaces: Vec<Interface>,
    demux: Demux,
    n_offline: usize,
    promiscuous: bool,
    filter: String,
    start_ts: i64,
    finish_ts: i64,
    last_ts: i64,
}

impl Engine {
    /// Builder with the default configuration.
    pub fn builder() -> crate::EngineBuilder {
        crate::EngineBuilder::default()
    }

    pub(crate) fn from_config(demux: Demux, promiscuous: bool, filter: String) -> Self {
        Self {
            interfaces: Vec::new(),
            demux,
            n_offline: 0,
            promiscuous,
            filter,
            start_ts: 0,
            finish_ts: 0,
            last_ts: 0,
        }
    }

    /// Open a capture source. A name that resolves to an existing file is
    /// replayed offline; anything else is opened live.
    pub fn open(&mut self, device: &str) -> Result<(), CaptureError> {
        if self.interfaces.len() >= MAX_INTERFACES {
            error!("too many capture sources (max {MAX_INTERFACES})");
            return Err(CaptureError::TooManyInterfaces {
                max: MAX_INTERFACES,
            });
        }

        let offline = Path::new(device).exists();
        // An offline source must stand alone: reject the combination before
        // opening anything, so a failed open leaves the engine untouched.
        if (offline && !self.interfaces.is_empty()) || (!offline && self.n_offline > 0) {
            error!("offline source must be the only source");
            return Err(CaptureError::OfflineMustBeExclusive);
        }

        let (handle, datalink) = if offline {
            let mut capture = Capture::from_file(device).map_err(|e| pcap_err(device, e))?;
            capture
                .filter(&self.filter, true)
                .map_err(|e| pcap_err(device, e))?;
            let datalink = select_datalink(device, capture.get_datalink().0)?;
            (CaptureHandle::Offline(capture), datalink)
        } else {
            // The 1 ms kernel timeout matters: we select() ourselves and
            // unconditionally try to read every interface, so a longer
            // timeout would stall the loop on a quiet interface.
            let capture = Capture::from_device(device)
                .map_err(|e| pcap_err(device, e))?
                .snaplen(PCAP_SNAPLEN)
                .promisc(self.promiscuous)
                .timeout(1)
                .open()
                .map_err(|e| pcap_err(device, e))?;
            let mut capture = capture.setnonblock().map_err(|e| pcap_err(device, e))?;
            capture
                .filter(&self.filter, true)
                .map_err(|e| pcap_err(device, e))?;
            let fd = capture.as_raw_fd();
            debug!("capture: opened {device} live, fd {fd}");
            let datalink = select_datalink(device, capture.get_datalink().0)?;
            (CaptureHandle::Live { capture, fd }, datalink)
        };

        if offline {
            self.n_offline += 1;
        }
        self.interfaces.push(Interface {
            device: device.to_string(),
            handle,
            datalink,
            ps0: StatSnapshot::default(),
            ps1: StatSnapshot::default(),
            pkts_captured: 0,
        });
        Ok(())
    }

    /// Process one measurement window, delivering every complete DNS
    /// message to `handler`. Returns `Ok(false)` once an offline source is
    /// exhausted.
    pub fn run<H: DnsHandler>(&mut self, handler: &mut H) -> Result<bool, CaptureError> {
        for iface in &mut self.interfaces {
            iface.pkts_captured = 0;
        }
        let more = if self.n_offline > 0 {
            self.run_offline(handler)
        } else {
            self.run_live(handler)
        };
        self.demux.expire_flows(self.last_ts - MAX_TCP_IDLE);
        more
    }

    fn run_offline<H: DnsHandler>(&mut self, handler: &mut H) -> Result<bool, CaptureError> {
        if self.finish_ts > 0 {
            self.start_ts = self.finish_ts;
            self.finish_ts += INTERVAL;
        }
        let demux = &mut self.demux;
        let Some(iface) = self.interfaces.first_mut() else {
            return Ok(false);
        };
        let CaptureHandle::Offline(capture) = &mut iface.handle else {
            return Ok(false);
        };
        loop {
            match capture.next_packet() {
                Ok(packet) => {
                    let ts_sec = packet.header.ts.tv_sec as i64;
                    let ts_usec = packet.header.ts.tv_usec as i64;
                    self.last_ts = ts_sec;
                    iface.pkts_captured += 1;
                    demux.handle_frame(iface.datalink, packet.data, ts_sec, ts_usec, handler);
                    if self.start_ts == 0 {
                        self.start_ts = ts_sec;
                        self.finish_ts = (ts_sec / INTERVAL + 1) * INTERVAL;
                    }
                    if self.last_ts >= self.finish_ts {
                        return Ok(true);
                    }
                }
                Err(pcap::Error::NoMorePackets) => {
                    // the window was cut short
                    self.finish_ts = self.last_ts;
                    return Ok(false);
                }
                Err(e) => {
                    debug!("capture: read error on {}: {e}", iface.device);
                    self.finish_ts = self.last_ts;
                    return Ok(false);
                }
            }
        }
    }

    fn run_live<H: DnsHandler>(&mut self, handler: &mut H) -> Result<bool, CaptureError> {
        self.start_ts = time::wall_clock_secs();
        self.finish_ts = (self.start_ts / INTERVAL + 1) * INTERVAL;

        while self.last_ts < self.finish_ts {
            let fds: Vec<RawFd> = self
                .interfaces
                .iter()
                .filter_map(|i| match &i.handle {
                    CaptureHandle::Live { fd, .. } => Some(*fd),
                    CaptureHandle::Offline(_) => None,
                })
                .collect();
            if !select_readable(&fds, SELECT_TIMEOUT_USEC) {
                self.last_ts = time::wall_clock_secs();
            }
            // The select result is advisory only: libpcap may already have
            // buffered packets that would not wake it, so always try to
            // read from every interface.
            let demux = &mut self.demux;
            let last_ts = &mut self.last_ts;
            for iface in &mut self.interfaces {
                let datalink = iface.datalink;
                let CaptureHandle::Live { capture, .. } = &mut iface.handle else {
                    continue;
                };
                loop {
                    match capture.next_packet() {
                        Ok(packet) => {
                            *last_ts = packet.header.ts.tv_sec as i64;
                            iface.pkts_captured += 1;
                            demux.handle_frame(
                                datalink,
                                packet.data,
                                packet.header.ts.tv_sec as i64,
                                packet.header.ts.tv_usec as i64,
                                handler,
                            );
                        }
                        Err(_) => break, // drained for now
                    }
                }
            }
        }

        for iface in &mut self.interfaces {
            if let CaptureHandle::Live { capture, .. } = &mut iface.handle {
                iface.ps0 = iface.ps1;
                match capture.stats() {
                    Ok(stat) => {
                        iface.ps1 = StatSnapshot {
                            received: stat.received,
                            dropped: stat.dropped,
                        };
                    }
                    Err(e) => debug!("capture: stats failed on {}: {e}", iface.device),
                }
            }
        }
        Ok(true)
    }

    /// First packet timestamp of the current window (seconds).
    pub fn start_time(&self) -> i64 {
        self.start_ts
    }

    /// End of the current window (seconds); clamped to the last packet
    /// when an offline source ran out.
    pub fn finish_time(&self) -> i64 {
        self.finish_ts
    }

    pub fn interfaces(&self) -> &[Interface] {
        &self.interfaces
    }

    pub fn demux(&self) -> &Demux {
        &self.demux
    }

    /// The window's per-interface counters.
    pub fn stats_report(&self) -> Vec<InterfaceStats> {
        self.interfaces
            .iter()
            .map(|i| InterfaceStats {
                ifname: i.device.clone(),
                pkts_captured: i.pkts_captured,
                filter_received: i.ps1.received.wrapping_sub(i.ps0.received),
                kernel_dropped: i.ps1.dropped.wrapping_sub(i.ps0.dropped),
            })
            .collect()
    }

    /// An indexer over the configured interface names.
    pub fn ifname_indexer(&self) -> InterfaceNameIndexer {
        InterfaceNameIndexer::new(self.interfaces.iter().map(|i| i.device.clone()).collect())
    }

    /// Drop every capture handle.
    pub fn close(&mut self) {
        self.interfaces.clear();
        self.n_offline = 0;
    }
}

fn pcap_err(device: &str, source: pcap::Error) -> CaptureError {
    error!("capture: {device}: {source}");
    CaptureError::Pcap {
        device: device.to_string(),
        source,
    }
}

fn select_datalink(device: &str, linktype: i32) -> Result<DatalinkType, CaptureError> {
    match linktype {
        0 => Ok(DatalinkType::Null),
        1 => Ok(DatalinkType::Ethernet),
        9 => Ok(DatalinkType::Ppp),
        101 => Ok(DatalinkType::Raw),
        108 => Ok(DatalinkType::Loop),
        other => {
            error!("unsupported data link type {other} on {device}");
            Err(CaptureError::UnsupportedDatalink {
                device: device.to_string(),
                linktype: other,
            })
        }
    }
}

// An empty fd set still sleeps out the timeout, pacing the live loop.
fn select_readable(fds: &[RawFd], timeout_usec: i64) -> bool {
    unsafe {
        let mut set: libc::fd_set = std::mem::zeroed();
        libc::FD_ZERO(&mut set);
        let mut nfds = 0;
        for &fd in fds {
            libc::FD_SET(fd, &mut set);
            if fd >= nfds {
                nfds = fd + 1;
            }
        }
        let mut timeout = libc::timeval {
            tv_sec: 0,
            tv_usec: timeout_usec as libc::suseconds_t,
        };
        libc::select(
            nfds,
            &mut set,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            &mut timeout,
        ) > 0
    }
}
