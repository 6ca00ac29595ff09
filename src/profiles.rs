//! Per-instrument acquisition parameters for every diagnostic.
//!
//! Each microscope/camera combination has its own table of beam and camera
//! settings per test. Beam intensity is the illuminated area in microns on
//! three-condenser optics (Krios) and the C2 percentage on two-condenser
//! optics (Glacios, Talos).
//!
//! Tables are static; callers resolve a bundle with [`resolve`] and hand it to
//! the session rather than reading shared mutable state.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{AppResult, EmError};

/// Diagnostic identifiers, in the order they appear in the test menu.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TestId {
    /// Stage drift after shifts and tilts
    StageDrift,
    /// Magnification anisotropy
    Anisotropy,
    /// Information limit by Young fringes
    InfoLimit,
    /// Thon rings in the power spectrum
    ThonRings,
    /// Point resolution
    PointRes,
    /// Gold diffraction spacings
    GoldDiffr,
    /// Fresnel fringes at the C2 aperture
    C2Fringes,
    /// Tilt axis offset
    TiltAxis,
    /// Gain reference check
    GainRef,
    /// AFIS calibration
    Afis,
    /// Stage eucentricity over a tilt series
    Eucentricity,
}

impl TestId {
    /// Every diagnostic, in menu order.
    pub const ALL: [TestId; 11] = [
        TestId::StageDrift,
        TestId::Anisotropy,
        TestId::InfoLimit,
        TestId::ThonRings,
        TestId::PointRes,
        TestId::GoldDiffr,
        TestId::C2Fringes,
        TestId::TiltAxis,
        TestId::GainRef,
        TestId::Afis,
        TestId::Eucentricity,
    ];

    /// Name used in parameter tables and log file names.
    pub fn as_str(&self) -> &'static str {
        match self {
            TestId::StageDrift => "StageDrift",
            TestId::Anisotropy => "Anisotropy",
            TestId::InfoLimit => "InfoLimit",
            TestId::ThonRings => "ThonRings",
            TestId::PointRes => "PointRes",
            TestId::GoldDiffr => "GoldDiffr",
            TestId::C2Fringes => "C2Fringes",
            TestId::TiltAxis => "TiltAxis",
            TestId::GainRef => "GainRef",
            TestId::Afis => "AFIS",
            TestId::Eucentricity => "Eucentricity",
        }
    }
}

impl fmt::Display for TestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TestId {
    type Err = EmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TestId::ALL
            .into_iter()
            .find(|id| id.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| EmError::Configuration(format!("Unknown test '{}'", s)))
    }
}

/// Pass criterion a diagnostic reports against.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Specification {
    /// Single limit, e.g. information limit in nm
    Limit(f64),
    /// Two limits, e.g. (coma nm, astigmatism nm) or (XY um, defocus um)
    Pair(f64, f64),
}

/// Parameters one diagnostic runs with on one instrument.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParameterBundle {
    /// Illuminated area (um) or C2 percentage, depending on optics
    pub beam: f64,
    /// Condenser spot size
    pub spot: u32,
    /// Nominal magnification
    pub mag: u32,
    /// Exposure in seconds
    pub exposure: f64,
    /// Camera binning
    pub binning: u32,
    /// Target defocus in um
    pub defocus: Option<f64>,
    /// Acceptance limit the result is reported against
    pub spec: Option<Specification>,
    /// Largest image shift in um used by AFIS checks
    pub max_image_shift: Option<f64>,
}

const fn bundle(beam: f64, spot: u32, mag: u32, exposure: f64, binning: u32) -> ParameterBundle {
    ParameterBundle {
        beam,
        spot,
        mag,
        exposure,
        binning,
        defocus: None,
        spec: None,
        max_image_shift: None,
    }
}

const fn with_defocus(mut b: ParameterBundle, defocus: f64) -> ParameterBundle {
    b.defocus = Some(defocus);
    b
}

const fn with_spec(mut b: ParameterBundle, spec: Specification) -> ParameterBundle {
    b.spec = Some(spec);
    b
}

const fn with_image_shift(mut b: ParameterBundle, max_um: f64) -> ParameterBundle {
    b.max_image_shift = Some(max_um);
    b
}

type Table = &'static [(TestId, ParameterBundle)];

// InfoLimit and GoldDiffr expect nanoprobe with the 150 um C2 aperture.
static KRIOS2_FALCON4: Table = &[
    (TestId::StageDrift, bundle(1.1, 4, 96000, 0.5, 2)),
    (TestId::Anisotropy, bundle(1.1, 4, 96000, 0.5, 2)),
    (
        TestId::InfoLimit,
        with_spec(with_defocus(bundle(1.05, 4, 600000, 3.0, 2), -0.1), Specification::Limit(0.14)),
    ),
    (
        TestId::ThonRings,
        with_spec(with_defocus(bundle(1.1, 3, 250000, 1.0, 2), -1.0), Specification::Limit(0.33)),
    ),
    (
        TestId::PointRes,
        with_spec(with_defocus(bundle(1.1, 3, 380000, 1.0, 2), -0.087), Specification::Limit(0.20)),
    ),
    (
        TestId::GoldDiffr,
        with_spec(with_defocus(bundle(1.1, 4, 600000, 3.0, 2), -0.1), Specification::Limit(0.1)),
    ),
    (TestId::C2Fringes, bundle(0.42, 6, 75000, 0.1, 1)),
    (TestId::TiltAxis, bundle(1.1, 5, 75000, 0.5, 2)),
    (TestId::GainRef, bundle(1.1, 7, 96000, 1.0, 1)),
    (
        TestId::Afis,
        with_image_shift(
            with_spec(with_defocus(bundle(1.1, 7, 96000, 1.0, 2), -2.0), Specification::Pair(750.0, 10.0)),
            12.0,
        ),
    ),
    (
        TestId::Eucentricity,
        with_spec(bundle(1.1, 4, 96000, 0.5, 2), Specification::Pair(1.0, 3.0)),
    ),
];

static KRIOS3_K3: Table = &[
    (TestId::StageDrift, bundle(0.66, 5, 105000, 0.5, 2)),
    (TestId::Anisotropy, bundle(0.66, 5, 105000, 0.5, 2)),
    (
        TestId::InfoLimit,
        with_spec(with_defocus(bundle(0.66, 5, 250000, 2.0, 1), -0.5), Specification::Limit(0.14)),
    ),
    (
        TestId::ThonRings,
        with_spec(with_defocus(bundle(0.66, 5, 250000, 1.0, 2), -0.5), Specification::Limit(0.33)),
    ),
    (
        TestId::PointRes,
        with_spec(with_defocus(bundle(0.66, 5, 380000, 1.0, 2), -0.073), Specification::Limit(0.20)),
    ),
    (
        TestId::GoldDiffr,
        with_spec(with_defocus(bundle(0.66, 5, 600000, 3.0, 2), -0.2), Specification::Limit(0.1)),
    ),
    (TestId::C2Fringes, with_defocus(bundle(0.66, 5, 105000, 0.5, 2), -1.0)),
    (TestId::TiltAxis, bundle(0.66, 5, 105000, 0.5, 2)),
    (TestId::GainRef, bundle(0.66, 5, 105000, 1.0, 1)),
    (
        TestId::Afis,
        with_image_shift(
            with_spec(with_defocus(bundle(0.66, 5, 105000, 1.0, 2), -2.0), Specification::Pair(750.0, 10.0)),
            12.0,
        ),
    ),
    (
        TestId::Eucentricity,
        with_spec(bundle(0.66, 5, 105000, 0.5, 2), Specification::Pair(1.0, 3.0)),
    ),
];

static GLACIOS_FALCON3: Table = &[
    (TestId::StageDrift, bundle(44.46, 3, 92000, 0.5, 2)),
    (TestId::Anisotropy, bundle(44.46, 3, 92000, 1.0, 2)),
    (TestId::InfoLimit, with_defocus(bundle(44.46, 3, 250000, 2.0, 1), -0.5)),
    (TestId::ThonRings, with_defocus(bundle(44.46, 3, 250000, 1.0, 2), -0.5)),
    (
        TestId::PointRes,
        with_spec(with_defocus(bundle(44.46, 3, 380000, 1.0, 2), -0.082), Specification::Limit(0.24)),
    ),
    (TestId::GoldDiffr, with_defocus(bundle(44.46, 3, 600000, 3.0, 2), -0.2)),
    (TestId::C2Fringes, bundle(39.701, 5, 92000, 0.1, 1)),
    (TestId::TiltAxis, bundle(44.46, 3, 92000, 0.5, 2)),
    (TestId::GainRef, bundle(44.46, 3, 92000, 1.0, 1)),
    (
        TestId::Afis,
        with_image_shift(
            with_spec(with_defocus(bundle(44.46, 3, 92000, 1.0, 2), -2.0), Specification::Pair(1200.0, 15.0)),
            6.0,
        ),
    ),
    (
        TestId::Eucentricity,
        with_spec(bundle(44.46, 3, 92000, 0.5, 2), Specification::Pair(1.0, 3.0)),
    ),
];

static PROFILES: &[(&str, Table)] = &[
    ("krios2_falcon4", KRIOS2_FALCON4),
    ("krios3_k3", KRIOS3_K3),
    ("glacios_falcon3", GLACIOS_FALCON3),
];

/// The parameter table of an instrument profile, if it exists.
pub fn profile(name: &str) -> Option<Table> {
    PROFILES
        .iter()
        .find(|(key, _)| *key == name)
        .map(|(_, table)| *table)
}

/// Names of the built-in instrument profiles.
pub fn profile_names() -> Vec<&'static str> {
    PROFILES.iter().map(|(key, _)| *key).collect()
}

/// Look up the parameters of `test` on instrument profile `instrument`.
pub fn resolve(instrument: &str, test: TestId) -> AppResult<ParameterBundle> {
    let table = profile(instrument).ok_or_else(|| {
        EmError::Configuration(format!("Unknown scope profile '{}'", instrument))
    })?;

    table
        .iter()
        .find(|(id, _)| *id == test)
        .map(|(_, bundle)| *bundle)
        .ok_or_else(|| {
            EmError::Configuration(format!(
                "Profile '{}' has no parameters for {}",
                instrument, test
            ))
        })
}
