#![allow(dead_code)]
use isogroup::{Dataset, DatasetRow, MetaboliteEntry};

pub const FEATURE_IDS: [&str; 9] = ["F1", "F2", "F3", "F4", "F5", "F6", "F7", "F8", "F9"];

pub const MZ: [f64; 9] = [
    119.025753,
    120.0291332,
    191.0191775654,
    119.0232843,
    137.0275004,
    136.024129,
    135.0208168,
    134.0174803,
    133.0140851,
];

pub const RT: [f64; 9] = [
    667.779067,
    667.9255408,
    679.9930235,
    678.1606593,
    676.4604364,
    676.5620229,
    676.6045604,
    676.8898827,
    676.8952154,
];

pub const SAMPLE_1: [f64; 9] = [
    1571414706.0,
    1059554882.0,
    31398195.78,
    0.0,
    529223407.9,
    2090662547.0,
    3105587268.0,
    2077278842.0,
    543216118.8,
];

pub const SAMPLE_2: [f64; 9] = [
    266171108.6,
    129533534.2,
    5324316.124,
    0.0,
    28994270.58,
    97127965.25,
    154077393.8,
    218743897.0,
    155940888.7,
];

pub fn make_dataset() -> Dataset {
    let mut dataset = Dataset::new(vec!["Sample_1".to_string(), "Sample_2".to_string()]);
    for i in 0..FEATURE_IDS.len() {
        dataset
            .push(DatasetRow::new(
                FEATURE_IDS[i],
                MZ[i],
                RT[i],
                vec![Some(SAMPLE_1[i]), Some(SAMPLE_2[i])],
            ))
            .unwrap();
    }
    dataset
}

pub fn make_database_entries() -> Vec<MetaboliteEntry> {
    [
        ("Fumarate", 979.0, "C4H4O4"),
        ("Succinate", 668.0, "C4H6O4"),
        ("Citrate", 680.0, "C6H8O7"),
        ("Isocitrate", 680.0, "C6H8O7"),
        ("Malate", 676.0, "C4H6O5"),
        ("a-KG", 883.0, "C5H6O5"),
        ("G6P", 890.0, "C6H13O9P"),
        ("ADP", 2050.0, "C10H15N5O10P2"),
    ]
    .into_iter()
    .map(|(name, rt, formula)| MetaboliteEntry::new(name, rt, formula, -1))
    .collect()
}
