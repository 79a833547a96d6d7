//! Cross-operator pipelines: distinct, distinct-on, ordering, scalar aggregates,
//! fan-out, and contract errors.

use std::rc::Rc;

use delta_view::aggregate::{ArrayAgg, Avg, Count, JsonAgg, JsonSpec, Max, Min, Sum};
use delta_view::operators::{Distinct, DistinctOn, Filter, Map, OrderBy};
use delta_view::split::SplitStream;
use delta_view::{by_column, value_cmp, Comparator, Error, Memory, OwnedRow, Record, Value, View};
use serde_json::json;

fn item(id: i64, value: i64) -> OwnedRow {
    [("id", json!(id)), ("value", json!(value))].into_iter().collect()
}

fn order_row(id: i64, user_id: i64, timestamp: i64) -> OwnedRow {
    [("id", json!(id)), ("userId", json!(user_id)), ("timestamp", json!(timestamp))]
        .into_iter()
        .collect()
}

#[test]
fn distinct_collapses_equal_rows_until_the_last_departs() {
    let memory = Memory::new(
        vec![item(1, 10), item(2, 10), item(3, 20)],
        "id",
    )
    .unwrap();
    // Equality by value: project away the id by comparing on the value column only.
    let values = Map::new(memory.connect(), |row: &OwnedRow| {
        OwnedRow::single("value", row.column("value"))
    })
    .unwrap();
    let distinct = Distinct::new(values, by_column("value")).unwrap();
    let view = View::new(distinct, by_column("value")).unwrap();

    let value_row = |v: i64| OwnedRow::single("value", json!(v));
    assert_eq!(view.materialize(), vec![value_row(10), value_row(20)]);

    // One of the two rows carrying 10 leaves: still referenced, still present.
    memory.remove(&item(1, 0)).unwrap();
    assert_eq!(view.current_state(), vec![value_row(10), value_row(20)]);

    // The last one leaves: the value departs the output.
    memory.remove(&item(2, 0)).unwrap();
    assert_eq!(view.current_state(), vec![value_row(20)]);
}

#[test]
fn distinct_on_keeps_the_most_recent_row_and_falls_back_on_delete() {
    let memory = Memory::new(vec![order_row(1, 100, 1000)], "id").unwrap();
    let most_recent_first: Comparator<OwnedRow> = {
        let tie: Comparator<OwnedRow> = by_column("id");
        Rc::new(move |a: &OwnedRow, b: &OwnedRow| {
            value_cmp(&b.column("timestamp"), &a.column("timestamp")).then_with(|| tie(a, b))
        })
    };
    let latest = DistinctOn::new(
        memory.connect(),
        |row: &OwnedRow| row.column("userId"),
        Rc::new(|a: &Value, b: &Value| value_cmp(a, b)),
        Some(most_recent_first),
    )
    .unwrap();
    let view = View::new(latest, by_column("userId")).unwrap();

    assert_eq!(view.materialize(), vec![order_row(1, 100, 1000)]);

    // A newer row for the same user replaces the emitted one.
    memory.add(order_row(2, 100, 2000)).unwrap();
    assert_eq!(view.current_state(), vec![order_row(2, 100, 2000)]);

    // Deleting the current best promotes the next-best automatically.
    memory.remove(&order_row(2, 0, 0)).unwrap();
    assert_eq!(view.current_state(), vec![order_row(1, 100, 1000)]);
}

#[test]
fn order_by_orders_pulls_and_passes_deltas_through() {
    let memory = Memory::new(vec![item(1, 30), item(2, 10), item(3, 20)], "id").unwrap();
    let ordered = OrderBy::new(memory.connect(), by_column("value")).unwrap();
    let view = View::new(ordered, by_column("value")).unwrap();

    assert_eq!(
        view.materialize(),
        vec![item(2, 10), item(3, 20), item(1, 30)]
    );
    memory.add(item(4, 15)).unwrap();
    assert_eq!(
        view.current_state(),
        vec![item(2, 10), item(4, 15), item(3, 20), item(1, 30)]
    );
}

#[test]
fn scalar_aggregates_follow_mutations() {
    let memory = Memory::new(vec![item(1, 10), item(2, 30)], "id").unwrap();

    let count_view = View::new(
        Count::new(memory.connect()).unwrap(),
        by_column("count"),
    )
    .unwrap();
    let sum_view = View::new(
        Sum::new(memory.connect(), "value").unwrap(),
        by_column("sum"),
    )
    .unwrap();
    let min_view = View::new(
        Min::new(memory.connect(), "value").unwrap(),
        by_column("min"),
    )
    .unwrap();
    let max_view = View::new(
        Max::new(memory.connect(), "value").unwrap(),
        by_column("max"),
    )
    .unwrap();
    let avg_view = View::new(
        Avg::new(memory.connect(), "value").unwrap(),
        by_column("avg"),
    )
    .unwrap();

    assert_eq!(count_view.materialize(), vec![OwnedRow::single("count", json!(2))]);
    assert_eq!(sum_view.materialize(), vec![OwnedRow::single("sum", json!(40.0))]);
    assert_eq!(min_view.materialize(), vec![OwnedRow::single("min", json!(10))]);
    assert_eq!(max_view.materialize(), vec![OwnedRow::single("max", json!(30))]);
    assert_eq!(avg_view.materialize(), vec![OwnedRow::single("avg", json!(20.0))]);

    memory.add(item(3, 50)).unwrap();
    memory.remove(&item(1, 0)).unwrap();

    assert_eq!(count_view.current_state(), vec![OwnedRow::single("count", json!(2))]);
    assert_eq!(sum_view.current_state(), vec![OwnedRow::single("sum", json!(80.0))]);
    assert_eq!(min_view.current_state(), vec![OwnedRow::single("min", json!(30))]);
    assert_eq!(max_view.current_state(), vec![OwnedRow::single("max", json!(50))]);
    assert_eq!(avg_view.current_state(), vec![OwnedRow::single("avg", json!(40.0))]);
}

#[test]
fn array_and_json_aggregates_follow_arrival_order() {
    let tag = |id: i64, name: &str| -> OwnedRow {
        [("id", json!(id)), ("name", json!(name))].into_iter().collect()
    };
    let memory = Memory::new(vec![tag(1, "a"), tag(2, "b")], "id").unwrap();

    let array_view = View::new(
        ArrayAgg::new(memory.connect(), "name").unwrap(),
        by_column("array_agg"),
    )
    .unwrap();
    let json_view = View::new(
        JsonAgg::new(
            memory.connect(),
            JsonSpec::Aliased(vec![("label".into(), "name".into())]),
        )
        .unwrap(),
        by_column("json_agg"),
    )
    .unwrap();

    assert_eq!(
        array_view.materialize(),
        vec![OwnedRow::single("array_agg", json!(["a", "b"]))]
    );
    assert_eq!(
        json_view.materialize(),
        vec![OwnedRow::single("json_agg", json!([{"label": "a"}, {"label": "b"}]))]
    );

    memory.add(tag(3, "c")).unwrap();
    memory.remove(&tag(1, "")).unwrap();
    assert_eq!(
        array_view.current_state(),
        vec![OwnedRow::single("array_agg", json!(["b", "c"]))]
    );
    assert_eq!(
        json_view.current_state(),
        vec![OwnedRow::single("json_agg", json!([{"label": "b"}, {"label": "c"}]))]
    );
}

#[test]
fn split_branches_deliver_to_independent_pipelines() {
    let memory = Memory::new(vec![item(1, 10), item(2, 25)], "id").unwrap();
    let split = SplitStream::new(memory.connect()).unwrap();

    let evens = Filter::new(split.branch(), |row: &OwnedRow| {
        row.column("value").as_i64().unwrap() % 2 == 0
    })
    .unwrap();
    let odds = Filter::new(split.branch(), |row: &OwnedRow| {
        row.column("value").as_i64().unwrap() % 2 != 0
    })
    .unwrap();
    let even_view = View::new(evens, by_column("id")).unwrap();
    let odd_view = View::new(odds, by_column("id")).unwrap();

    assert_eq!(even_view.materialize(), vec![item(1, 10)]);
    assert_eq!(odd_view.materialize(), vec![item(2, 25)]);

    memory.add(item(3, 12)).unwrap();
    memory.add(item(4, 13)).unwrap();
    assert_eq!(even_view.current_state(), vec![item(1, 10), item(3, 12)]);
    assert_eq!(odd_view.current_state(), vec![item(2, 25), item(4, 13)]);
}

#[test]
fn a_collapsing_comparator_silently_merges_distinct_rows() {
    // The comparator contract: set-semantic containers must be given an order that
    // distinguishes distinct rows. This pins what happens when it is not: rows
    // equal under the comparator share one multiplicity slot, and the stored
    // representative is whichever arrived last.
    let by_value_only: Comparator<OwnedRow> =
        Rc::new(|a: &OwnedRow, b: &OwnedRow| value_cmp(&a.column("value"), &b.column("value")));
    let memory = Memory::new(vec![item(1, 10), item(2, 10)], "id").unwrap();
    let view = View::new(memory.connect(), by_value_only).unwrap();

    let state = view.materialize();
    assert_eq!(state.len(), 2);
    assert_eq!(state[0], state[1], "equal-comparing rows collapse to one representative");
}

#[test]
fn a_source_accepts_exactly_one_sink() {
    let memory = Memory::new(vec![item(1, 10)], "id").unwrap();
    let connection = memory.connect();
    let _first = View::new(connection.clone(), by_column("id")).unwrap();
    match View::new(connection, by_column("id")) {
        Err(Error::SinkAlreadySet(_)) => {}
        Err(other) => panic!("unexpected error {other:?}"),
        Ok(_) => panic!("second sink attachment must fail"),
    }
}

#[test]
fn filter_map_chains_agree_between_push_and_pull() {
    let memory = Memory::new(
        (1..=20).map(|i| item(i, i * 7 % 13)).collect(),
        "id",
    )
    .unwrap();
    let big = Filter::new(memory.connect(), |row: &OwnedRow| {
        row.column("value").as_i64().unwrap() >= 5
    })
    .unwrap();
    let doubled = Map::new(big, |row: &OwnedRow| {
        OwnedRow::single("id", row.column("id"))
            .with("value", json!(row.column("value").as_i64().unwrap() * 2))
    })
    .unwrap();
    let view = View::new(doubled, by_column("id")).unwrap();

    view.materialize();
    memory.add(item(21, 9)).unwrap();
    memory.remove(&item(7, 0)).unwrap();
    // Row 9 drops below the filter threshold: the update must retract its pair.
    memory.update(&item(9, 0), |r| r.clone().with("value", json!(1))).unwrap();

    assert_eq!(view.current_state(), view.materialize());
}
