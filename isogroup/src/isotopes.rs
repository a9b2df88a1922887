/*! Isotope mass tables used to derive tracer mass shifts and formula masses */
use std::borrow::Cow;
use std::collections::HashMap;

pub use chemical_elements::{PeriodicTable, PERIODIC_TABLE};

/// A source of isotope masses keyed by element symbol.
///
/// The masses of an element are ordered by increasing mass, so that index 0 is the
/// lightest isotope.
pub trait IsotopeTable {
    /// Get the ordered isotope masses of `element`, if it is known
    fn masses(&self, element: &str) -> Option<Cow<'_, [f64]>>;

    fn contains(&self, element: &str) -> bool {
        self.masses(element).is_some()
    }

    /// The mass of the isotope a formula is counted in when no isotope is named.
    ///
    /// Defaults to the lightest isotope.
    fn monoisotopic_mass(&self, element: &str) -> Option<f64> {
        self.masses(element).and_then(|m| m.first().copied())
    }
}

/// The periodic table every parse uses unless another table is given
pub fn default_isotope_table() -> &'static PeriodicTable {
    &PERIODIC_TABLE
}

impl IsotopeTable for PeriodicTable {
    fn masses(&self, element: &str) -> Option<Cow<'_, [f64]>> {
        let element = self.get(element)?;
        let mut masses: Vec<f64> = element.isotopes.values().map(|i| i.mass).collect();
        masses.sort_by(f64::total_cmp);
        Some(Cow::Owned(masses))
    }

    fn contains(&self, element: &str) -> bool {
        self.get(element).is_some()
    }

    /// The mass of the most abundant isotope, which is what formula masses are built from
    fn monoisotopic_mass(&self, element: &str) -> Option<f64> {
        self.get(element).map(|e| e.most_abundant_mass)
    }
}

impl IsotopeTable for HashMap<String, Vec<f64>> {
    fn masses(&self, element: &str) -> Option<Cow<'_, [f64]>> {
        self.get(element).map(|m| Cow::Borrowed(m.as_slice()))
    }
}
