//! Submission fixtures for E2E testing

use serde_json::{json, Value};

/// A submission and the terminal status it is expected to reach.
#[derive(Debug, Clone)]
pub struct SubmissionFixture {
    pub visits: &'static [(&'static str, &'static [&'static str])],
    pub expected_status: &'static str,
    pub expected_failed_stores: &'static [&'static str],
    pub description: &'static str,
}

impl SubmissionFixture {
    pub fn body(&self) -> Value {
        let visits: Vec<Value> = self
            .visits
            .iter()
            .map(|(store_id, urls)| {
                json!({
                    "store_id": store_id,
                    "image_url": urls,
                    "visit_time": "2024-01-01T10:00:00Z",
                })
            })
            .collect();
        json!({ "count": visits.len(), "visits": visits })
    }
}

/// Store ids must exist in the reference CSV the worker was started with
/// (see `data/StoreMasterAssignment.csv`).
pub const SUBMISSION_FIXTURES: &[SubmissionFixture] = &[
    SubmissionFixture {
        visits: &[(
            "RP00001",
            &[
                "https://www.gstatic.com/webp/gallery/1.jpg",
                "https://www.gstatic.com/webp/gallery/2.jpg",
            ],
        )],
        expected_status: "completed",
        expected_failed_stores: &[],
        description: "Single known store, two images",
    },
    SubmissionFixture {
        visits: &[
            ("S00339218", &["https://www.gstatic.com/webp/gallery/3.jpg"]),
            ("S01408764", &["https://www.gstatic.com/webp/gallery/3.jpg"]),
        ],
        expected_status: "failed",
        expected_failed_stores: &["S01408764"],
        description: "One store missing from reference data",
    },
];
