/*! Isotopic tracer descriptions */
use std::fmt::Display;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

use crate::isotopes::{default_isotope_table, IsotopeTable};

/// An error that might occur while interpreting a tracer code
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TracerError {
    #[error("Invalid tracer code: '{0}'. Expected an isotope mass number followed by an element symbol, e.g. 13C")]
    InvalidTracer(String),
    #[error("Unexpected tracer code '{0}'. No labeling isotope of this element matches the mass number")]
    UnknownIsotope(String),
    #[error("The maximum isotopologue heuristic is not available for tracer element {0}")]
    UnsupportedElement(String),
}

static TRACER_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d*)([A-Z][a-z]*)$").expect("tracer pattern is valid"));

/// The fraction of a molecule's nominal mass that may plausibly be made up of the
/// tracer element, used when the chemical formula is unknown.
fn isotopologue_cap_factor(element: &str) -> Option<f64> {
    match element {
        "C" => Some(0.7),
        "N" => Some(0.2),
        "O" => Some(0.3),
        _ => None,
    }
}

/// A parsed isotopic tracer, e.g. `13C`.
///
/// Once derived from a tracer code, a [`TracerSpec`] is immutable and always describes a
/// heavy isotope, so that [`TracerSpec::mass_shift`] is strictly positive.
#[derive(Debug, Clone, PartialEq)]
pub struct TracerSpec {
    code: String,
    element: String,
    isotope_index: usize,
    mass_shift: f64,
    atomic_mass: f64,
}

impl TracerSpec {
    /// Parse a tracer code using the default periodic table
    pub fn parse(code: &str) -> Result<Self, TracerError> {
        Self::parse_with(code, default_isotope_table())
    }

    /// Parse a tracer code, resolving isotope masses from `table`.
    ///
    /// The isotope chosen is the one whose mass is closest to the mass number in the code,
    /// which must be within 0.5 Da of it and heavier than the element's monoisotopic mass.
    pub fn parse_with<T: IsotopeTable + ?Sized>(code: &str, table: &T) -> Result<Self, TracerError> {
        let code = code.trim();
        let invalid = || TracerError::InvalidTracer(code.to_string());

        let captures = TRACER_PATTERN.captures(code).ok_or_else(invalid)?;
        let mass_number: u32 = captures[1].parse().map_err(|_| invalid())?;
        let element = captures[2].to_string();
        let masses = table.masses(&element).ok_or_else(invalid)?;
        let atomic_mass = table.monoisotopic_mass(&element).ok_or_else(invalid)?;

        let (isotope_index, best_diff) = masses
            .iter()
            .enumerate()
            .map(|(i, mass)| (i, (mass - mass_number as f64).abs()))
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .ok_or_else(invalid)?;

        let mass_shift = masses[isotope_index] - atomic_mass;
        // The natural isotope, or a lighter one, cannot label anything
        if best_diff >= 0.5 || mass_shift <= 0.0 {
            return Err(TracerError::UnknownIsotope(code.to_string()));
        }

        Ok(Self {
            code: code.to_string(),
            element,
            isotope_index,
            mass_shift,
            atomic_mass,
        })
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    /// The symbol of the labeled element
    pub fn element(&self) -> &str {
        &self.element
    }

    /// The position of the labeling isotope in the element's mass-ordered isotope list
    pub fn isotope_index(&self) -> usize {
        self.isotope_index
    }

    /// The mass difference between the labeling isotope and the natural isotope
    pub fn mass_shift(&self) -> f64 {
        self.mass_shift
    }

    /// The monoisotopic mass of the labeled element
    pub fn atomic_mass(&self) -> f64 {
        self.atomic_mass
    }

    /// The empirical fraction used by [`TracerSpec::max_isotopologues_for_mz`]
    pub fn isotopologue_cap_factor(&self) -> Result<f64, TracerError> {
        isotopologue_cap_factor(&self.element)
            .ok_or_else(|| TracerError::UnsupportedElement(self.element.clone()))
    }

    /// Estimate the largest number of tracer atoms a molecule observed at `mz` could
    /// carry, `max(1, floor(factor * mz / atomic_mass))`.
    pub fn max_isotopologues_for_mz(&self, mz: f64) -> Result<u32, TracerError> {
        let factor = self.isotopologue_cap_factor()?;
        Ok(cap_isotopologues(factor, mz, self.atomic_mass))
    }

    /// The number of tracer mass shifts separating `mz` from `base_mz`, rounded half to even
    #[inline]
    pub fn isotopologue_index(&self, mz: f64, base_mz: f64) -> i64 {
        ((mz - base_mz) / self.mass_shift).round_ties_even() as i64
    }

    /// The theoretical m/z of the `index`-th isotopologue of `base_mz`
    #[inline]
    pub fn expected_mz(&self, base_mz: f64, index: i64) -> f64 {
        base_mz + index as f64 * self.mass_shift
    }
}

#[inline]
pub(crate) fn cap_isotopologues(factor: f64, mz: f64, atomic_mass: f64) -> u32 {
    ((factor * mz / atomic_mass).floor() as u32).max(1)
}

impl Display for TracerSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code)
    }
}

impl FromStr for TracerSpec {
    type Err = TracerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<&str> for TracerSpec {
    type Error = TracerError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}
