// I2C bus arbiter
// Exactly one owner for the shared I2C line: the arbiter's run loop is the
// only code path that touches the text panel. Everyone else queues a
// BusRequest and moves on.

use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info, warn};
use thiserror::Error;

/// Preferred panel address (Freenove backpack default), probed first.
pub const PANEL_ADDR_PRIMARY: u8 = 0x27;
/// Fallback panel address, probed only when the primary stays silent.
pub const PANEL_ADDR_SECONDARY: u8 = 0x3F;
/// Visible characters per panel line.
pub const PANEL_LINE_WIDTH: usize = 16;

const REQUEST_QUEUE_CAPACITY: usize = 8;
const ENQUEUE_TIMEOUT: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
pub enum DisplayFault {
    #[error("no panel responded at 0x{primary:02X} or 0x{secondary:02X}")]
    DeviceNotDetected { primary: u8, secondary: u8 },
    #[error("panel i/o failed: {0}")]
    Io(String),
}

/// One render: two lines plus an optional post-render hold during which the
/// arbiter blocks before servicing the next request.
#[derive(Debug, Clone)]
pub struct BusRequest {
    pub line1: String,
    pub line2: String,
    pub hold: Duration,
}

impl BusRequest {
    pub fn new(line1: &str, line2: &str, hold: Duration) -> Self {
        Self {
            line1: clip_line(line1),
            line2: clip_line(line2),
            hold,
        }
    }
}

fn clip_line(text: &str) -> String {
    text.chars().take(PANEL_LINE_WIDTH).collect()
}

/// Seam to the physical panel. `probe` answers whether anything ACKs at the
/// address; the remaining calls assume a detected, initialized device.
pub trait TextPanelBus: Send {
    fn probe(&mut self, address: u8) -> bool;
    fn initialize(&mut self, address: u8) -> Result<(), DisplayFault>;
    fn clear(&mut self) -> Result<(), DisplayFault>;
    fn write_line(&mut self, row: u8, text: &str) -> Result<(), DisplayFault>;
}

/// Cloneable producer side handed to every unit that wants a status line.
#[derive(Clone)]
pub struct DisplayHandle {
    tx: Sender<BusRequest>,
}

impl DisplayHandle {
    /// Queue a render. Returns false when the queue stays full through the
    /// enqueue timeout; the caller treats that as best-effort and moves on.
    pub fn request_text(&self, line1: &str, line2: &str, hold: Duration) -> bool {
        let request = BusRequest::new(line1, line2, hold);
        match self.tx.send_timeout(request, ENQUEUE_TIMEOUT) {
            Ok(()) => true,
            Err(e) => {
                error!("display request dropped, queue full or closed: {e}");
                false
            }
        }
    }
}

pub struct PanelArbiter {
    panel: Box<dyn TextPanelBus>,
    rx: Receiver<BusRequest>,
    detected_address: Option<u8>,
    probe_failed: bool,
}

impl PanelArbiter {
    pub fn new(panel: Box<dyn TextPanelBus>) -> (Self, DisplayHandle) {
        let (tx, rx) = bounded(REQUEST_QUEUE_CAPACITY);
        (
            Self {
                panel,
                rx,
                detected_address: None,
                probe_failed: false,
            },
            DisplayHandle { tx },
        )
    }

    /// Service requests until every DisplayHandle is gone.
    pub fn run_loop(&mut self) {
        info!("panel arbiter loop started");
        loop {
            match self.rx.recv_timeout(Duration::from_millis(100)) {
                Ok(request) => {
                    if !self.render(&request) {
                        warn!(
                            "panel render failed. line1={:?} line2={:?}",
                            request.line1, request.line2
                        );
                    }
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    info!("panel arbiter loop stopping, all handles dropped");
                    return;
                }
            }
        }
    }

    /// Render one request atomically: clear, line 1, line 2, then the
    /// blocking hold. Only ever called from the arbiter's own loop (or a
    /// test driving it directly).
    pub fn render(&mut self, request: &BusRequest) -> bool {
        let address = match self.ensure_panel() {
            Some(address) => address,
            None => return false,
        };

        match self.write_lines(request) {
            Ok(()) => {
                debug!(
                    "panel rendered at 0x{address:02X}. line1={:?} line2={:?} hold={:?}",
                    request.line1, request.line2, request.hold
                );
                if !request.hold.is_zero() {
                    thread::sleep(request.hold);
                }
                true
            }
            Err(e) => {
                error!("panel write failed at 0x{address:02X}: {e}");
                false
            }
        }
    }

    fn write_lines(&mut self, request: &BusRequest) -> Result<(), DisplayFault> {
        self.panel.clear()?;
        self.panel.write_line(0, &request.line1)?;
        self.panel.write_line(1, &request.line2)
    }

    /// Detect and initialize the panel on first use. A failed scan is
    /// terminal: the failure is latched and never re-probed.
    fn ensure_panel(&mut self) -> Option<u8> {
        if self.probe_failed {
            return None;
        }
        if let Some(address) = self.detected_address {
            return Some(address);
        }

        let address = if self.panel.probe(PANEL_ADDR_PRIMARY) {
            info!("panel detected at 0x{PANEL_ADDR_PRIMARY:02X} (preferred)");
            PANEL_ADDR_PRIMARY
        } else if self.panel.probe(PANEL_ADDR_SECONDARY) {
            info!("panel detected at 0x{PANEL_ADDR_SECONDARY:02X} (fallback)");
            PANEL_ADDR_SECONDARY
        } else {
            self.probe_failed = true;
            error!(
                "{}",
                DisplayFault::DeviceNotDetected {
                    primary: PANEL_ADDR_PRIMARY,
                    secondary: PANEL_ADDR_SECONDARY,
                }
            );
            return None;
        };

        if let Err(e) = self.panel.initialize(address) {
            // Initialization trouble is treated like a missing device; the
            // bus stays untouched from here on.
            self.probe_failed = true;
            error!("panel initialization failed at 0x{address:02X}: {e}");
            return None;
        }
        self.detected_address = Some(address);
        Some(address)
    }
}

/// Register the arbiter's run loop on its own thread and hand back the
/// producer side.
pub fn spawn_panel_arbiter(
    panel: Box<dyn TextPanelBus>,
) -> std::io::Result<(DisplayHandle, JoinHandle<()>)> {
    let (mut arbiter, handle) = PanelArbiter::new(panel);
    let join = thread::Builder::new()
        .name("i2c-arbiter".into())
        .spawn(move || arbiter.run_loop())?;
    Ok((handle, join))
}
