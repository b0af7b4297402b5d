use crate::consts::MIN_SEND_FREQUENCY;

/// Minimum-interval gate derived from a send frequency in packets per second.
///
/// The baseline advances by whole periods so a late tick does not push every
/// following send back. When the gate has been open for more than two periods it
/// restarts from the current time instead of catching up.
#[derive(Debug, Clone)]
pub struct SendPacer {
    frequency: u16,
    period: f64,
    last_send_time: f64,
}

impl SendPacer {
    pub fn new(frequency: u16) -> Self {
        let frequency = frequency.max(MIN_SEND_FREQUENCY);
        Self {
            frequency,
            period: 1.0 / f64::from(frequency),
            last_send_time: f64::NEG_INFINITY,
        }
    }
    pub fn frequency(&self) -> u16 {
        self.frequency
    }
    pub fn period(&self) -> f64 {
        self.period
    }
    /// Returns the frequency actually applied.
    pub fn set_frequency(&mut self, frequency: u16) -> u16 {
        self.frequency = frequency.max(MIN_SEND_FREQUENCY);
        self.period = 1.0 / f64::from(self.frequency);
        self.frequency
    }
    /// Opens the gate immediately.
    pub fn reset(&mut self) {
        self.last_send_time = f64::NEG_INFINITY;
    }
    pub fn is_ready(&self, now: f64) -> bool {
        now - self.last_send_time >= self.period
    }
    pub fn on_sent(&mut self, now: f64) {
        if now - self.last_send_time > 2.0 * self.period {
            self.last_send_time = now;
        } else {
            self.last_send_time += self.period;
        }
    }
}
