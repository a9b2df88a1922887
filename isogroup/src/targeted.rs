//! Targeted annotation of features against a database of known metabolites.
//!
//! A [`Database`] expands each [`MetaboliteEntry`] into the theoretical m/z of every
//! tracer isotopologue of its formula. The [`TargetedAnnotator`] matches observed features
//! against those within fixed tolerances and groups the matches into one named cluster per
//! metabolite, reusing the same [`Cluster`] model as untargeted clustering.
use std::fmt::Display;
use std::str::FromStr;

use chemical_elements::ChemicalComposition;
use indexmap::IndexMap;
use itertools::Itertools;
use rayon::prelude::*;
use thiserror::Error;
use tracing::debug;

use crate::cluster::Cluster;
use crate::engine::{ClusterMap, SampleClusters, SampleMap};
use crate::feature::{ClusterId, IsotopologueLabel, SampleFeatures};
use crate::isotopes::{default_isotope_table, IsotopeTable, PeriodicTable, PERIODIC_TABLE};
use crate::tracer::{TracerError, TracerSpec};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TargetedError {
    #[error("Invalid chemical formula '{0}'")]
    InvalidFormula(String),
    #[error("Failed to configure the tracer: {0}")]
    Tracer(#[from] TracerError),
}

/// Check that every element symbol in `formula` is known to `table` and that groups are
/// balanced, so that the composition parser only ever sees resolvable symbols.
fn symbols_known(formula: &str, table: &PeriodicTable) -> bool {
    let mut chars = formula.char_indices().peekable();
    let mut depth = 0usize;
    while let Some((start, c)) = chars.next() {
        if c.is_ascii_uppercase() {
            let mut end = start + 1;
            while let Some((i, _)) = chars.next_if(|(_, c)| c.is_ascii_lowercase()) {
                end = i + 1;
            }
            if table.get(&formula[start..end]).is_none() {
                return false;
            }
        } else if c == '(' {
            depth += 1;
        } else if c == ')' {
            if depth == 0 {
                return false;
            }
            depth -= 1;
        } else if !c.is_ascii_digit() {
            return false;
        }
    }
    depth == 0
}

/// An elemental composition such as `C6H8O7`
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChemicalFormula {
    formula: String,
    composition: ChemicalComposition<'static>,
}

impl ChemicalFormula {
    /// Parse a formula written as element symbols each followed by an optional count,
    /// with optional parenthesized groups. Repeated elements are summed.
    pub fn parse(formula: &str) -> Result<Self, TargetedError> {
        let formula = formula.trim();
        let invalid = || TargetedError::InvalidFormula(formula.to_string());
        if formula.is_empty() || !symbols_known(formula, &PERIODIC_TABLE) {
            return Err(invalid());
        }

        let composition = ChemicalComposition::parse_with(formula, &PERIODIC_TABLE).map_err(|e| {
            debug!("Failed to parse formula '{formula}': {e}");
            invalid()
        })?;
        Ok(Self {
            formula: formula.to_string(),
            composition,
        })
    }

    /// The number of atoms of `element`, zero when absent
    pub fn count(&self, element: &str) -> u32 {
        self.elements()
            .filter(|(e, _)| *e == element)
            .map(|(_, n)| n)
            .sum()
    }

    pub fn elements(&self) -> impl Iterator<Item = (&str, u32)> {
        self.composition
            .iter()
            .map(|(spec, n)| {
                (
                    spec.element.symbol.as_str(),
                    u32::try_from(*n).unwrap_or_default(),
                )
            })
    }

    pub fn composition(&self) -> &ChemicalComposition<'static> {
        &self.composition
    }

    /// The monoisotopic mass according to the default periodic table
    pub fn mass(&self) -> f64 {
        self.composition.mass()
    }

    /// The mass of the formula built from each element's monoisotopic mass in `table`
    pub fn monoisotopic_mass<T: IsotopeTable + ?Sized>(&self, table: &T) -> Result<f64, TargetedError> {
        self.elements().try_fold(0.0, |acc, (element, count)| {
            let mass = table
                .monoisotopic_mass(element)
                .ok_or_else(|| TargetedError::InvalidFormula(self.formula.clone()))?;
            Ok(acc + mass * count as f64)
        })
    }
}

impl Display for ChemicalFormula {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.formula)
    }
}

impl FromStr for ChemicalFormula {
    type Err = TargetedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// A known metabolite to search for
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MetaboliteEntry {
    pub metabolite: String,
    pub rt: f64,
    pub formula: String,
    pub charge: i32,
}

impl MetaboliteEntry {
    pub fn new(metabolite: impl Into<String>, rt: f64, formula: impl Into<String>, charge: i32) -> Self {
        Self {
            metabolite: metabolite.into(),
            rt,
            formula: formula.into(),
            charge,
        }
    }
}

/// The expected m/z and retention time of one isotopologue of a database metabolite
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TheoreticalFeature {
    pub metabolite: String,
    pub formula: String,
    pub isotopologue: u32,
    pub mz: f64,
    pub rt: f64,
}

/// A match between an observed feature and a [`TheoreticalFeature`]
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TargetedAnnotation {
    pub metabolite: String,
    pub isotopologue: u32,
    pub formula: String,
    /// `(theoretical - observed) / observed`, in ppm
    pub mz_error_ppm: f64,
    /// `theoretical - observed` retention time
    pub rt_error: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Database {
    tracer: TracerSpec,
    entries: Vec<MetaboliteEntry>,
    tracer_atoms: IndexMap<String, u32>,
    features: Vec<TheoreticalFeature>,
}

impl Database {
    pub fn new(entries: Vec<MetaboliteEntry>, tracer: TracerSpec) -> Result<Self, TargetedError> {
        Self::new_with(entries, tracer, default_isotope_table())
    }

    /// Build the theoretical features of every entry, isotopologues `0..=n` where `n` is
    /// the number of tracer element atoms in the entry's formula.
    pub fn new_with<T: IsotopeTable + ?Sized>(
        entries: Vec<MetaboliteEntry>,
        tracer: TracerSpec,
        table: &T,
    ) -> Result<Self, TargetedError> {
        let proton = table
            .monoisotopic_mass("H")
            .ok_or_else(|| TargetedError::InvalidFormula("H".to_string()))?;

        let mut tracer_atoms = IndexMap::new();
        let mut features = Vec::new();
        for entry in entries.iter() {
            let formula = ChemicalFormula::parse(&entry.formula)?;
            let mass = formula.monoisotopic_mass(table)?;
            let n = formula.count(tracer.element());
            tracer_atoms.entry(entry.metabolite.clone()).or_insert(n);

            for i in 0..=n {
                features.push(TheoreticalFeature {
                    metabolite: entry.metabolite.clone(),
                    formula: entry.formula.clone(),
                    isotopologue: i,
                    mz: mass + i as f64 * tracer.mass_shift() + entry.charge as f64 * proton,
                    rt: entry.rt,
                });
            }
        }
        debug!(
            "Built {} theoretical features from {} metabolites",
            features.len(),
            entries.len()
        );
        Ok(Self {
            tracer,
            entries,
            tracer_atoms,
            features,
        })
    }

    pub fn tracer(&self) -> &TracerSpec {
        &self.tracer
    }

    pub fn entries(&self) -> &[MetaboliteEntry] {
        &self.entries
    }

    pub fn features(&self) -> &[TheoreticalFeature] {
        &self.features
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The number of tracer element atoms in `metabolite`'s formula
    pub fn tracer_atoms(&self, metabolite: &str) -> Option<u32> {
        self.tracer_atoms.get(metabolite).copied()
    }
}

/// Matching tolerances for targeted annotation
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TargetedParams {
    pub ppm_tolerance: f64,
    pub rt_tolerance: f64,
}

impl Default for TargetedParams {
    fn default() -> Self {
        Self {
            ppm_tolerance: 5.0,
            rt_tolerance: 10.0,
        }
    }
}

impl TargetedParams {
    pub fn new(ppm_tolerance: f64, rt_tolerance: f64) -> Self {
        Self {
            ppm_tolerance,
            rt_tolerance,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TargetedAnnotator<'a> {
    database: &'a Database,
    params: TargetedParams,
}

impl<'a> TargetedAnnotator<'a> {
    pub fn new(database: &'a Database, params: TargetedParams) -> Self {
        Self { database, params }
    }

    pub fn database(&self) -> &'a Database {
        self.database
    }

    pub fn params(&self) -> &TargetedParams {
        &self.params
    }

    /// Annotate the features of every sample, replacing earlier annotations.
    /// Returns the total number of matches.
    pub fn annotate(&self, samples: &mut SampleMap) -> usize {
        samples
            .par_values_mut()
            .map(|features| self.annotate_sample(features))
            .sum()
    }

    pub fn annotate_sample(&self, features: &mut SampleFeatures) -> usize {
        let mut matches = 0;
        for feature in features.iter_mut() {
            feature.clear_annotations();
            for theoretical in self.database.features.iter() {
                let mz_error_ppm = (theoretical.mz - feature.mz()) / feature.mz() * 1e6;
                let rt_error = theoretical.rt - feature.rt();
                if mz_error_ppm.abs() <= self.params.ppm_tolerance
                    && rt_error.abs() <= self.params.rt_tolerance
                {
                    feature.push_annotation(TargetedAnnotation {
                        metabolite: theoretical.metabolite.clone(),
                        isotopologue: theoretical.isotopologue,
                        formula: theoretical.formula.clone(),
                        mz_error_ppm,
                        rt_error,
                    });
                    matches += 1;
                }
            }
        }
        debug!("{}: {matches} database matches", features.name());
        matches
    }

    /// Group annotated features into one cluster per metabolite.
    ///
    /// Metabolites are numbered in name order across all samples, so a metabolite has the
    /// same [`ClusterId`] in every sample it was found in. Members are sorted by isotopologue.
    pub fn clusterize(&self, samples: &mut SampleMap) -> ClusterMap {
        let names: Vec<String> = samples
            .values()
            .flat_map(|s| s.iter().flat_map(|(_, f)| f.annotations()))
            .map(|a| a.metabolite.clone())
            .unique()
            .sorted()
            .collect();

        samples
            .iter_mut()
            .map(|(sample, features)| (sample.clone(), self.clusterize_sample(features, &names)))
            .collect()
    }

    fn clusterize_sample(&self, features: &mut SampleFeatures, names: &[String]) -> SampleClusters {
        features.clear_clusters();
        let mut clusters = SampleClusters::new();
        for (i, name) in names.iter().enumerate() {
            let id = ClusterId(i);
            let mut members: Vec<_> = features
                .iter()
                .filter_map(|(key, f)| {
                    f.annotations()
                        .iter()
                        .find(|a| a.metabolite == *name)
                        .map(|a| (key, a.isotopologue))
                })
                .collect();
            if members.is_empty() {
                continue;
            }
            members.sort_by_key(|(_, iso)| *iso);

            for (key, iso) in members.iter().copied() {
                if let Some(f) = features.get_mut(key) {
                    f.assign_cluster(id, IsotopologueLabel::from_index(iso));
                }
            }

            let tracer_atoms = self.database.tracer_atoms(name).unwrap_or_default();
            let cluster = Cluster::new(id, features.name(), members.into_iter().map(|(k, _)| k).collect())
                .with_identity(name.clone(), tracer_atoms);
            clusters.insert(id, cluster);
        }
        debug!("{}: {} targeted clusters", features.name(), clusters.len());
        clusters
    }
}
