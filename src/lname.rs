//! Connection lname generation
//!
//! Every accepted connection gets a process-unique logical name of the
//! form `"<hex_time>_<hex_counter>@<hostname>"`. The counter starts at
//! a random value so that lnames stay unique across client restarts
//! against the same broker instance; a monotonic-only counter would
//! repeat after a broker restart within the same wall-clock second.

use std::time::{SystemTime, UNIX_EPOCH};

/// Generator for connection lnames
#[derive(Debug)]
pub struct LnameGenerator {
    hostname: String,
    counter: u64,
}

impl LnameGenerator {
    /// Create a generator with a randomly seeded counter
    pub fn new() -> Self {
        Self::with_seed(rand::random())
    }

    /// Create a generator from an explicit counter seed
    pub fn with_seed(seed: u64) -> Self {
        let hostname = nix::unistd::gethostname()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "localhost".to_string());
        Self {
            hostname,
            counter: seed,
        }
    }

    /// Produce the next lname
    pub fn next_lname(&mut self) -> String {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let counter = self.counter;
        self.counter = self.counter.wrapping_add(1);
        format!("{:x}_{:x}@{}", now, counter, self.hostname)
    }
}

impl Default for LnameGenerator {
    fn default() -> Self {
        Self::new()
    }
}
