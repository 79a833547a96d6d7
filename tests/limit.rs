//! Top-k maintenance: eviction, deletion-induced refill, and pull laziness.

use std::cell::Cell;
use std::rc::Rc;

use delta_view::operators::{Filter, Limit};
use delta_view::{by_column, Memory, OwnedRow, Record, View};
use serde_json::json;

fn item(id: i64, value: i64) -> OwnedRow {
    [("id", json!(id)), ("value", json!(value))].into_iter().collect()
}

#[test]
fn top_k_with_deletion_induced_refill() {
    let memory = Memory::new(vec![item(6, 60), item(7, 35), item(8, 80)], "id").unwrap();
    let source = memory.connect_sorted("value", by_column("value"));
    let limit = Limit::new(source, 3, by_column("value")).unwrap();
    let view = View::new(limit, by_column("value")).unwrap();

    assert_eq!(view.materialize(), vec![item(7, 35), item(6, 60), item(8, 80)]);

    for (id, value) in [(1, 10), (2, 50), (3, 20), (4, 40), (5, 30)] {
        memory.add(item(id, value)).unwrap();
    }
    assert_eq!(view.current_state(), vec![item(1, 10), item(3, 20), item(5, 30)]);

    // Deleting a member opens a vacancy; the refill pulls the next-best row (35)
    // back in from the base table.
    memory.remove(&item(3, 0)).unwrap();
    assert_eq!(view.current_state(), vec![item(1, 10), item(5, 30), item(7, 35)]);

    memory.add(item(9, 15)).unwrap();
    assert_eq!(view.current_state(), vec![item(1, 10), item(9, 15), item(5, 30)]);
}

#[test]
fn incremental_state_matches_cold_materialization() {
    let memory = Memory::new(vec![item(6, 60), item(7, 35), item(8, 80)], "id").unwrap();
    let source = memory.connect_sorted("value", by_column("value"));
    let limit = Limit::new(source, 3, by_column("value")).unwrap();
    let view = View::new(limit, by_column("value")).unwrap();
    view.materialize();

    for (id, value) in [(1, 10), (2, 50), (3, 20), (4, 40), (5, 30)] {
        memory.add(item(id, value)).unwrap();
    }
    memory.remove(&item(2, 0)).unwrap();
    memory.remove(&item(1, 0)).unwrap();

    let incremental = view.current_state();
    assert_eq!(incremental, view.materialize());
    assert!(incremental.len() <= 3);
}

#[test]
fn limited_pull_reads_a_bounded_prefix_of_the_base() {
    let rows: Vec<OwnedRow> = (1..=1000).map(|i| item(i, i)).collect();
    let memory = Memory::new(rows, "id").unwrap();

    let reads = Rc::new(Cell::new(0usize));
    let counter = reads.clone();
    let evens = Filter::new(memory.connect(), move |row: &OwnedRow| {
        counter.set(counter.get() + 1);
        row.column("value").as_i64().unwrap() % 2 == 0
    })
    .unwrap();
    let limit = Limit::new(evens, 2, by_column("value")).unwrap();
    let view = View::new(limit, by_column("value")).unwrap();

    assert_eq!(view.materialize(), vec![item(2, 2), item(4, 4)]);
    // Two accepted rows live among the first four base rows; the scan must have
    // stopped there instead of draining the table.
    assert!(reads.get() < 5, "pulled {} base rows", reads.get());
}

#[test]
fn limit_zero_stays_empty() {
    let memory = Memory::new(vec![item(1, 10)], "id").unwrap();
    let limit = Limit::new(memory.connect(), 0, by_column("value")).unwrap();
    let view = View::new(limit, by_column("value")).unwrap();
    assert!(view.materialize().is_empty());
    memory.add(item(2, 20)).unwrap();
    assert!(view.current_state().is_empty());
}
