use crate::mem::GuestLayout;

/// What to do when the guest touches a port no device claims.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UnhandledIoPolicy {
    /// Step over the instruction. `IN` reads all-ones.
    #[default]
    Skip,
    /// Stop the guest with [`VmmError::UnhandledIoPort`](crate::VmmError::UnhandledIoPort).
    Terminate,
}

/// Settings of one monitor run.
#[derive(Debug, Clone, Default)]
pub struct VmmConfig {
    pub layout: GuestLayout,
    pub unhandled_io: UnhandledIoPolicy,
}

impl VmmConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_layout(mut self, layout: GuestLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn with_load_offset(mut self, offset: usize) -> Self {
        self.layout.load_offset = offset;
        self
    }

    pub fn with_stack_top(mut self, stack_top: usize) -> Self {
        self.layout.stack_top = stack_top;
        self
    }

    pub fn with_unhandled_io(mut self, policy: UnhandledIoPolicy) -> Self {
        self.unhandled_io = policy;
        self
    }
}
