//! Tests for the document model: mutations and selections working together.

use serde_json::json;
use stratum::document::fields::Document;
use stratum::document::id::DocumentId;
use stratum::document::selection::Selection;
use stratum::document::update::{FieldMutation, UpdateEngine};

fn song() -> Document {
    let mut doc = Document::blank(DocumentId::parse("music::song-1").unwrap(), "music");
    doc.set_field("title", json!("Diamond Dust"));
    doc.set_field("plays", json!(100));
    doc.set_field("state", json!("live"));
    doc
}

#[test]
fn mutations_then_selection_sees_new_state() {
    let mut doc = song();
    UpdateEngine
        .apply(
            &mut doc,
            &[
                FieldMutation::ArithmeticAdd {
                    field: "plays".into(),
                    delta: 50.0,
                },
                FieldMutation::Assign {
                    field: "state".into(),
                    value: json!("retired"),
                },
            ],
        )
        .unwrap();

    assert!(Selection::parse("plays == 150").unwrap().evaluate(&doc));
    assert!(Selection::parse("state == 'retired'").unwrap().evaluate(&doc));
    assert!(!Selection::parse("state == 'live'").unwrap().evaluate(&doc));
}

#[test]
fn selection_against_payload_round_trip() {
    let doc = song();
    let payload = doc.to_payload().unwrap();
    let restored = Document::from_payload(&payload).unwrap();

    let selection = Selection::parse("music.plays >= 100 and title == 'Diamond Dust'").unwrap();
    assert!(selection.evaluate(&restored));
}

#[test]
fn clear_all_then_selection_finds_nothing() {
    let mut doc = song();
    UpdateEngine.apply(&mut doc, &[FieldMutation::ClearAll]).unwrap();
    assert!(!Selection::parse("plays >= 0").unwrap().evaluate(&doc));
}

#[test]
fn failed_mutation_reports_the_field() {
    let mut doc = song();
    let err = UpdateEngine
        .apply(
            &mut doc,
            &[FieldMutation::ArithmeticAdd {
                field: "title".into(),
                delta: 1.0,
            }],
        )
        .unwrap_err();
    assert!(err.to_string().contains("title"));
}

#[test]
fn bucket_assignment_survives_mutation() {
    let mut doc = song();
    let bucket = doc.id.bucket();
    UpdateEngine
        .apply(
            &mut doc,
            &[FieldMutation::Assign {
                field: "plays".into(),
                value: json!(0),
            }],
        )
        .unwrap();
    assert_eq!(doc.id.bucket(), bucket);
}
