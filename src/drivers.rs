//! Contracts for the screen-capture and input collaborators.
//!
//! The engine never talks to a platform directly; hosts provide these traits.
//! All input calls are synchronous. Moves receive the shared run flag and are
//! expected to poll it, so a stop request interrupts a move mid-flight; the
//! engine re-checks the flag itself before committing a click that follows an
//! interruptible move.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use image::RgbImage;

use crate::detect::Region;
use crate::error::DriverError;

/// Shared run flag. Cleared from any thread to halt the engine and interrupt
/// in-flight pointer moves.
#[derive(Debug, Clone, Default)]
pub struct RunFlag(Arc<AtomicBool>);

impl RunFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, running: bool) {
        self.0.store(running, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Screen capture contract: a fixed-size RGB buffer matching the requested
/// region, same layout every call.
pub trait ScreenCapture: Send {
    fn capture(&mut self, region: Region) -> Result<RgbImage, DriverError>;

    /// Sample a single pixel. The default goes through a 1×1 capture.
    fn pixel(&mut self, x: u32, y: u32) -> Result<[u8; 3], DriverError> {
        let img = self.capture(Region::new(x, y, 1, 1))?;
        let p = img.get_pixel(0, 0);
        Ok([p[0], p[1], p[2]])
    }
}

/// Pointer and keyboard contract.
pub trait InputDriver: Send {
    /// Move the pointer, taking `duration` to get there. Implementations
    /// must poll `run` and abandon the move once it clears.
    fn move_to(
        &mut self,
        x: i32,
        y: i32,
        duration: Duration,
        run: &RunFlag,
    ) -> Result<(), DriverError>;

    fn click(&mut self) -> Result<(), DriverError>;

    fn right_click(&mut self) -> Result<(), DriverError>;

    fn press(&mut self, key: &str) -> Result<(), DriverError>;

    fn write(&mut self, text: &str) -> Result<(), DriverError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    struct SolidCapture(Rgb<u8>);

    impl ScreenCapture for SolidCapture {
        fn capture(&mut self, region: Region) -> Result<RgbImage, DriverError> {
            Ok(RgbImage::from_pixel(region.width, region.height, self.0))
        }
    }

    #[test]
    fn test_default_pixel_goes_through_capture() {
        let mut capture = SolidCapture(Rgb([9, 8, 7]));
        assert_eq!(capture.pixel(100, 200).unwrap(), [9, 8, 7]);
    }

    #[test]
    fn test_run_flag_round_trip() {
        let flag = RunFlag::new();
        assert!(!flag.is_running());
        flag.set(true);
        let clone = flag.clone();
        assert!(clone.is_running());
        clone.set(false);
        assert!(!flag.is_running());
    }
}
