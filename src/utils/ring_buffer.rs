const CAPACITY: usize = 16;

/// Fixed-size log of the most recent state transitions of one thread.
///
/// Dumped alongside protocol defects and barrier timeouts to show how the thread
/// got where it is.
#[derive(Default, Clone, Debug)]
pub struct TransitionRingBuffer {
    buffer: [Option<String>; CAPACITY],
    index: usize,
    total: u64,
}

impl TransitionRingBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: String) {
        self.buffer[self.index] = Some(entry);
        self.index = (self.index + 1) % CAPACITY;
        self.total += 1;
    }

    /// Entries oldest first, each prefixed with its sequence number.
    pub fn entries(&self) -> Vec<String> {
        let retained = self.total.min(CAPACITY as u64);
        let first_seq = self.total - retained;
        (0..CAPACITY)
            .filter_map(|i| self.buffer[(self.index + i) % CAPACITY].as_ref())
            .enumerate()
            .map(|(n, entry)| format!("#{} {}", first_seq + n as u64, entry))
            .collect()
    }
}
