use crate::config::{ConfigError, Configuration};

/// Mechanical assembly of a detector model.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum Assembly {
    /// Sensor with integrated readout.
    Monolithic,
    /// Sensor bump-bonded to a separate readout chip.
    Hybrid {
        /// Thickness of the readout chip.
        chip_thickness: f64,
        /// Height of the bump bonds between sensor and chip.
        bump_height: f64,
    },
}

/// Static description of a detector type, shared by all detectors of that
/// type.
///
/// Lengths are in millimeters.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DetectorModel {
    type_name: String,
    number_of_pixels: [u32; 2],
    pixel_size: [f64; 2],
    sensor_thickness: f64,
    assembly: Assembly,
}

impl DetectorModel {
    /// Creates a model.
    pub fn new(
        type_name: impl Into<String>,
        number_of_pixels: [u32; 2],
        pixel_size: [f64; 2],
        sensor_thickness: f64,
        assembly: Assembly,
    ) -> Self {
        Self {
            type_name: type_name.into(),
            number_of_pixels,
            pixel_size,
            sensor_thickness,
            assembly,
        }
    }

    /// Reads a model from a configuration section whose name is the model
    /// type.
    ///
    /// Recognized keys are `number_of_pixels`, `pixel_size`,
    /// `sensor_thickness` and `assembly` (`monolithic` or `hybrid`); hybrid
    /// models additionally accept `chip_thickness` and `bump_height`.
    pub fn from_config(config: &Configuration) -> Result<Self, ConfigError> {
        let assembly = match config.get_choice("assembly", &["monolithic", "hybrid"])? {
            "hybrid" => Assembly::Hybrid {
                chip_thickness: config.get("chip_thickness")?,
                bump_height: config.get_or("bump_height", 0.0)?,
            },
            _ => Assembly::Monolithic,
        };

        let number_of_pixels: [u32; 2] = config.get("number_of_pixels")?;
        if number_of_pixels.contains(&0) {
            return Err(config.invalid_value("number_of_pixels", "pixel matrix cannot be empty"));
        }
        let pixel_size: [f64; 2] = config.get("pixel_size")?;
        if pixel_size.iter().any(|size| *size <= 0.0) {
            return Err(config.invalid_value("pixel_size", "pixel pitch must be positive"));
        }

        Ok(Self::new(
            config.name(),
            number_of_pixels,
            pixel_size,
            config.get("sensor_thickness")?,
            assembly,
        ))
    }

    /// Returns the model type name.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Returns the number of pixel columns and rows.
    pub fn number_of_pixels(&self) -> [u32; 2] {
        self.number_of_pixels
    }

    /// Returns the total number of pixels.
    pub fn pixel_count(&self) -> u64 {
        u64::from(self.number_of_pixels[0]) * u64::from(self.number_of_pixels[1])
    }

    /// Returns the pixel pitch along both matrix axes.
    pub fn pixel_size(&self) -> [f64; 2] {
        self.pixel_size
    }

    /// Returns the sensor thickness.
    pub fn sensor_thickness(&self) -> f64 {
        self.sensor_thickness
    }

    /// Returns the size of the sensitive matrix and its thickness.
    pub fn sensor_size(&self) -> [f64; 3] {
        [
            f64::from(self.number_of_pixels[0]) * self.pixel_size[0],
            f64::from(self.number_of_pixels[1]) * self.pixel_size[1],
            self.sensor_thickness,
        ]
    }

    /// Returns the assembly of the model.
    pub fn assembly(&self) -> &Assembly {
        &self.assembly
    }

    /// Checks whether the model carries a separate readout chip.
    pub fn is_hybrid(&self) -> bool {
        matches!(self.assembly, Assembly::Hybrid { .. })
    }
}
