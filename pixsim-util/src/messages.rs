//! Message payloads exchanged by the helper modules.

/// Charge collected by one pixel.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PixelCharge {
    /// Column and row of the pixel.
    pub pixel: [u32; 2],
    /// Collected charge, in electrons.
    pub charge: f64,
}

/// Charges deposited in the pixels of one detector during an event.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DepositedCharges {
    /// Deposits, one per hit pixel.
    pub charges: Vec<PixelCharge>,
}

impl DepositedCharges {
    /// Returns the total deposited charge.
    pub fn total(&self) -> f64 {
        self.charges.iter().map(|c| c.charge).sum()
    }
}

/// Pixels of one detector whose charge passed the digitization threshold.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PixelHits {
    /// Digitized pixels.
    pub hits: Vec<PixelCharge>,
}

impl PixelHits {
    /// Returns the number of hit pixels.
    pub fn len(&self) -> usize {
        self.hits.len()
    }

    /// Checks whether no pixel was hit.
    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }
}
