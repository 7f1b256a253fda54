use serde::Deserialize;

/// Parcelport configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ParcelportConfig {
    /// Number of pooled senders. Bounds in-flight outbound messages.
    pub num_senders: usize,
    /// Number of receive buffers kept posted.
    pub num_receivers: usize,
    /// Size of every receive buffer, which is also the budget for a header
    /// plus its chunk table plus a piggybacked payload.
    pub header_size: usize,
    /// Capacities of the pooled region classes, ascending. Requests larger
    /// than the last class get an exact-size ad hoc region.
    pub size_classes: Vec<usize>,
    /// Regions registered up front for each class.
    pub regions_per_class: Vec<usize>,
    /// Regions registered at once when a class runs dry.
    pub refill_batch: usize,
    /// Zero-copy chunks up to this size are copied into a pooled region
    /// instead of being registered in place.
    pub memory_copy_threshold: usize,
    /// Zero-copy chunks up to this size are embedded in the header when
    /// they fit. Zero disables inlining.
    pub inline_chunk_threshold: usize,
    /// Dedicated polling threads started with the parcelport.
    pub polling_threads: usize,
    /// CPU to pin the first polling thread to.
    pub pin_poller_cpu: Option<u16>,
    /// How long `stop` waits for outstanding sends before failing them
    /// with `Stopped`.
    pub stop_timeout_ms: u64,
}

impl Default for ParcelportConfig {
    fn default() -> Self {
        Self {
            num_senders: 64,
            num_receivers: 32,
            header_size: 4096,
            size_classes: vec![4 << 10, 64 << 10, 1 << 20],
            regions_per_class: vec![16, 4, 1],
            refill_batch: 1,
            memory_copy_threshold: 4096,
            inline_chunk_threshold: 64,
            polling_threads: 0,
            pin_poller_cpu: None,
            stop_timeout_ms: 5000,
        }
    }
}

impl ParcelportConfig {
    pub fn with_num_senders(mut self, n: usize) -> Self {
        self.num_senders = n;
        self
    }

    pub fn with_num_receivers(mut self, n: usize) -> Self {
        self.num_receivers = n;
        self
    }

    pub fn with_header_size(mut self, size: usize) -> Self {
        self.header_size = size;
        self
    }

    pub fn with_size_classes(mut self, classes: Vec<usize>, prealloc: Vec<usize>) -> Self {
        self.size_classes = classes;
        self.regions_per_class = prealloc;
        self
    }

    pub fn with_refill_batch(mut self, batch: usize) -> Self {
        self.refill_batch = batch;
        self
    }

    pub fn with_memory_copy_threshold(mut self, threshold: usize) -> Self {
        self.memory_copy_threshold = threshold;
        self
    }

    pub fn with_inline_chunk_threshold(mut self, threshold: usize) -> Self {
        self.inline_chunk_threshold = threshold;
        self
    }

    pub fn with_polling_threads(mut self, n: usize) -> Self {
        self.polling_threads = n;
        self
    }

    pub fn with_pin_poller_cpu(mut self, cpu: Option<u16>) -> Self {
        self.pin_poller_cpu = cpu;
        self
    }

    pub fn with_stop_timeout_ms(mut self, ms: u64) -> Self {
        self.stop_timeout_ms = ms;
        self
    }

    /// Smallest pooled region capacity.
    pub fn small_chunk_size(&self) -> usize {
        self.size_classes.first().copied().unwrap_or(self.header_size)
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        if self.num_senders == 0 || self.num_receivers == 0 {
            return Err("num_senders and num_receivers must be > 0");
        }
        if self.size_classes.is_empty() {
            return Err("size_classes must not be empty");
        }
        if !self.size_classes.windows(2).all(|w| w[0] < w[1]) {
            return Err("size_classes must be strictly ascending");
        }
        if self.regions_per_class.len() != self.size_classes.len() {
            return Err("regions_per_class must match size_classes");
        }
        if self.refill_batch == 0 {
            return Err("refill_batch must be > 0");
        }
        if self.header_size > self.small_chunk_size() {
            return Err("header_size must fit the smallest size class");
        }
        if self.header_size < crate::header::HEADER_FIXED_LEN + 8 {
            return Err("header_size too small for the fixed header");
        }
        Ok(())
    }
}
