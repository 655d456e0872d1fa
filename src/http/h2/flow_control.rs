//! HTTP/2 flow control (RFC 7540 Section 5.2)
//!
//! The client never sends DATA, so the receive side carries the weight
//! here: every DATA frame the peer sends is charged against a connection
//! window and a stream window, and both are refunded when the caller
//! acknowledges the bytes. The send side only mirrors what the peer grants.

use super::error::{Error, Result};
use super::settings::MAX_WINDOW_SIZE;
use super::DEFAULT_INITIAL_WINDOW_SIZE;

/// One flow control window
#[derive(Debug, Clone)]
pub struct FlowControlWindow {
    initial_size: u32,
    /// Signed: a SETTINGS change may push it below zero
    current_size: i64,
}

impl FlowControlWindow {
    pub fn new(initial_size: u32) -> Self {
        FlowControlWindow {
            initial_size,
            current_size: initial_size as i64,
        }
    }

    pub fn size(&self) -> i64 {
        self.current_size
    }

    pub fn initial_size(&self) -> u32 {
        self.initial_size
    }

    /// Charge `amount` bytes; overrunning the window is the peer's
    /// flow control violation
    pub fn consume(&mut self, amount: usize) -> Result<()> {
        let remaining = self.current_size - amount as i64;
        if remaining < 0 {
            return Err(Error::FlowControl(format!(
                "{} bytes received with only {} bytes of window",
                amount, self.current_size
            )));
        }
        self.current_size = remaining;
        Ok(())
    }

    /// Grow the window (a WINDOW_UPDATE sent or received)
    pub fn increase(&mut self, increment: u32) -> Result<i64> {
        if increment == 0 {
            return Err(Error::Protocol("WINDOW_UPDATE increment of 0".to_string()));
        }
        let new_size = self.current_size + increment as i64;
        if new_size > MAX_WINDOW_SIZE as i64 {
            return Err(Error::FlowControl(format!(
                "Window size {} exceeds 2^31-1",
                new_size
            )));
        }
        self.current_size = new_size;
        Ok(new_size)
    }

    /// Apply a new SETTINGS_INITIAL_WINDOW_SIZE by the difference to the old one
    pub fn update_initial_size(&mut self, new_initial_size: u32) -> Result<()> {
        let new_current = self.current_size + new_initial_size as i64 - self.initial_size as i64;
        if new_current > MAX_WINDOW_SIZE as i64 {
            return Err(Error::FlowControl(format!(
                "Window size {} exceeds 2^31-1 after SETTINGS",
                new_current
            )));
        }
        self.initial_size = new_initial_size;
        self.current_size = new_current;
        Ok(())
    }
}

impl Default for FlowControlWindow {
    fn default() -> Self {
        Self::new(DEFAULT_INITIAL_WINDOW_SIZE)
    }
}

/// Send and receive windows for the connection or one stream
#[derive(Debug, Clone, Default)]
pub struct FlowControl {
    /// What the peer lets us send
    pub send: FlowControlWindow,
    /// What we let the peer send
    pub recv: FlowControlWindow,
}

impl FlowControl {
    pub fn new(send_initial: u32, recv_initial: u32) -> Self {
        FlowControl {
            send: FlowControlWindow::new(send_initial),
            recv: FlowControlWindow::new(recv_initial),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consume_and_refund() {
        let mut window = FlowControlWindow::new(100);
        window.consume(60).unwrap();
        assert_eq!(window.size(), 40);

        window.increase(60).unwrap();
        assert_eq!(window.size(), 100);
    }

    #[test]
    fn test_overrun_is_flow_control_error() {
        let mut window = FlowControlWindow::new(10);
        assert!(matches!(window.consume(11), Err(Error::FlowControl(_))));
        assert_eq!(window.size(), 10);
    }

    #[test]
    fn test_increase_limits() {
        let mut window = FlowControlWindow::new(MAX_WINDOW_SIZE);
        assert!(matches!(window.increase(1), Err(Error::FlowControl(_))));
        assert!(matches!(window.increase(0), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_update_initial_size_applies_difference() {
        let mut window = FlowControlWindow::new(100);
        window.consume(50).unwrap();

        window.update_initial_size(200).unwrap();
        assert_eq!(window.initial_size(), 200);
        assert_eq!(window.size(), 150);

        window.update_initial_size(20).unwrap();
        assert_eq!(window.size(), -30);
    }

    #[test]
    fn test_default_pair() {
        let flow = FlowControl::default();
        assert_eq!(flow.send.size(), DEFAULT_INITIAL_WINDOW_SIZE as i64);
        assert_eq!(flow.recv.size(), DEFAULT_INITIAL_WINDOW_SIZE as i64);
    }
}
