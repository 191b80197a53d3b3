//! Particle localization on live frames.
//!
//! A [`LocalizationWorker`] follows a frame topic with a small drop-oldest
//! queue, runs a [`Locator`] on the newest frame only and publishes the
//! resulting [`LocationSet`] on `<topic>_locations`.

mod locate;
mod worker;

pub use locate::{CentroidLocator, LocateError, LocateParams, Location, LocationSet, Locator};
pub use worker::{run_locator, LocalizationError, LocalizationWorker, LOCATE_POLL, LOCATE_QUEUE};
