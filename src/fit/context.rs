//! Explicit per-call context: configuration plus the diagnostics sink.

use crate::domain::SkyConfig;
use crate::report::Reporter;

pub struct SkyContext<'a> {
    pub config: SkyConfig,
    pub reporter: &'a mut dyn Reporter,
}

impl<'a> SkyContext<'a> {
    pub fn new(config: SkyConfig, reporter: &'a mut dyn Reporter) -> Self {
        Self { config, reporter }
    }

    pub(crate) fn info(&mut self, message: impl AsRef<str>) {
        self.reporter.info(message.as_ref());
    }

    pub(crate) fn warn(&mut self, message: impl AsRef<str>) {
        self.reporter.warn(message.as_ref());
    }
}
