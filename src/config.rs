use crate::error::ConsensusError;

/// Runtime configuration of a poset and its consensus worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PosetConfig {
    /// Frames per super-frame. The member set is swapped after the last one is decided.
    pub super_frame_len: u32,
    /// Upper bound of events waiting for parents in the ordering buffer.
    pub max_buffered_events: usize,
    /// Capacity of the command channel in front of the consensus worker.
    pub command_buffer: usize,
    /// Capacity of the broadcast channel carrying consensus events.
    pub event_bus_capacity: usize,
}

impl Default for PosetConfig {
    fn default() -> Self {
        Self {
            super_frame_len: 100,
            max_buffered_events: 10_000,
            command_buffer: 1024,
            event_bus_capacity: 1000,
        }
    }
}

impl PosetConfig {
    pub fn builder() -> PosetConfigBuilder {
        PosetConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConsensusError> {
        if self.super_frame_len == 0 {
            return Err(ConsensusError::InvalidConfiguration(
                "super_frame_len must be greater than 0".to_string(),
            ));
        }
        if self.max_buffered_events == 0 {
            return Err(ConsensusError::InvalidConfiguration(
                "max_buffered_events must be greater than 0".to_string(),
            ));
        }
        if self.command_buffer == 0 || self.event_bus_capacity == 0 {
            return Err(ConsensusError::InvalidConfiguration(
                "channel capacities must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

pub struct PosetConfigBuilder {
    config: PosetConfig,
}

impl PosetConfigBuilder {
    pub(crate) fn new() -> Self {
        Self {
            config: PosetConfig::default(),
        }
    }

    /// Start builder from an existing PosetConfig (useful for partial updates)
    pub fn from_existing(config: PosetConfig) -> Self {
        Self { config }
    }

    pub fn with_super_frame_len(mut self, super_frame_len: u32) -> Self {
        self.config.super_frame_len = super_frame_len;
        self
    }

    pub fn with_max_buffered_events(mut self, max_buffered_events: usize) -> Self {
        self.config.max_buffered_events = max_buffered_events;
        self
    }

    pub fn with_command_buffer(mut self, command_buffer: usize) -> Self {
        self.config.command_buffer = command_buffer;
        self
    }

    pub fn with_event_bus_capacity(mut self, event_bus_capacity: usize) -> Self {
        self.config.event_bus_capacity = event_bus_capacity;
        self
    }

    /// Small buffers and short super-frames, for tests and simulations.
    pub fn testing_preset(mut self) -> Self {
        self.config.super_frame_len = 4;
        self.config.max_buffered_events = 256;
        self.config.command_buffer = 64;
        self.config.event_bus_capacity = 64;
        self
    }

    pub fn validate(&self) -> Result<(), ConsensusError> {
        self.config.validate()
    }

    /// Build the final PosetConfig
    pub fn build(self) -> Result<PosetConfig, ConsensusError> {
        self.validate()?;
        Ok(self.config)
    }
}

impl Default for PosetConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
