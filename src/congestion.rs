//! Per-frame vehicle counts and a 0-100 congestion index.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

use crate::detect::Detection;

pub const DEFAULT_ALPHA: f32 = 5.0;
const UNKNOWN_WEIGHT: f32 = 1.0;

/// Model class names and their English aliases.
const DEFAULT_WEIGHTS: &[(&str, f32)] = &[
    ("승용차", 1.5),
    ("버스", 3.5),
    ("트럭", 2.5),
    ("오토바이(자전거)", 1.0),
    ("car", 1.5),
    ("bus", 3.5),
    ("truck", 2.5),
    ("motorcycle", 1.0),
    ("bicycle", 1.0),
];

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CongestionReport {
    pub counts_by_class: BTreeMap<String, u32>,
    pub total_vehicles: u32,
    pub weighted_traffic: f32,
    pub congestion_index: u8,
}

#[derive(Clone, Debug)]
pub struct CongestionAggregator {
    weights: HashMap<String, f32>,
    alpha: f32,
}

impl Default for CongestionAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_ALPHA, HashMap::new())
    }
}

impl CongestionAggregator {
    /// `overrides` replace or extend the built-in class weights.
    pub fn new(alpha: f32, overrides: HashMap<String, f32>) -> Self {
        let mut weights: HashMap<String, f32> = DEFAULT_WEIGHTS
            .iter()
            .map(|(label, w)| (label.to_string(), *w))
            .collect();
        weights.extend(overrides);
        Self { weights, alpha }
    }

    pub fn weight(&self, label: &str) -> f32 {
        self.weights.get(label).copied().unwrap_or(UNKNOWN_WEIGHT)
    }

    pub fn index_for(&self, weighted_traffic: f32) -> u8 {
        (self.alpha * weighted_traffic).round().clamp(0.0, 100.0) as u8
    }

    pub fn summarize(&self, detections: &[Detection]) -> CongestionReport {
        let mut report = CongestionReport::default();
        for det in detections {
            *report.counts_by_class.entry(det.label.clone()).or_insert(0) += 1;
            report.total_vehicles += 1;
            report.weighted_traffic += self.weight(&det.label);
        }
        report.congestion_index = self.index_for(report.weighted_traffic);
        report
    }
}
