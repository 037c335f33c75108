/// Frame size stored in kilobytes (1 KB = 1000 bytes), the unit the regression model works in.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default)]
pub struct FrameSize(f64);

impl FrameSize {
    #[inline]
    pub fn from_bytes(bytes: u32) -> FrameSize {
        FrameSize(bytes as f64 / 1000.0)
    }

    #[inline]
    pub fn from_kilobytes(kilobytes: f64) -> FrameSize {
        FrameSize(kilobytes)
    }

    #[inline]
    pub fn kilobytes(&self) -> f64 {
        self.0
    }

    /// Rounded to the nearest byte. NaN and negative sizes saturate to 0.
    #[inline]
    pub fn bytes(&self) -> u32 {
        (self.0 * 1000.0).round() as u32
    }
}

/// Converts a packet delay to whole milliseconds, rounding up.
#[inline]
pub fn delay_us_to_ms(delay_us: u32) -> u32 {
    (delay_us as f64 / 1000.0).ceil() as u32
}
