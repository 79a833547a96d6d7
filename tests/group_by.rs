//! Grouping and the per-group aggregation family.

use delta_view::aggregate::{
    ArrayAggGroupBy, AvgGroupBy, CountGroupBy, JsonAggGroupBy, JsonSpec, MaxGroupBy, MinGroupBy,
    SumGroupBy,
};
use delta_view::operators::{GroupBy, MultiRowCombine};
use delta_view::{by_column, Memory, OwnedRow, Record, Value, View};
use serde_json::json;

fn row(user_id: i64, id: i64) -> OwnedRow {
    [("userId", json!(user_id)), ("id", json!(id))].into_iter().collect()
}

fn order(id: i64, user_id: i64, amount: f64) -> OwnedRow {
    [("id", json!(id)), ("userId", json!(user_id)), ("amount", json!(amount))]
        .into_iter()
        .collect()
}

fn agg_row(user_id: i64, key: &str, value: Value) -> OwnedRow {
    [("userId", json!(user_id)), (key, value)].into_iter().collect()
}

#[test]
fn group_by_count_tracks_group_membership() {
    let memory = Memory::new(vec![row(1, 1), row(1, 2), row(2, 3), row(3, 4)], "id").unwrap();
    let groups = GroupBy::new(memory.connect(), &["userId"], by_column("id")).unwrap();
    let counts = CountGroupBy::new(groups).unwrap();
    let view = View::new(counts, by_column("userId")).unwrap();

    let expect = |pairs: &[(i64, i64)]| -> Vec<OwnedRow> {
        pairs.iter().map(|&(u, c)| agg_row(u, "count", json!(c))).collect()
    };

    assert_eq!(view.materialize(), expect(&[(1, 2), (2, 1), (3, 1)]));

    memory.add(row(1, 5)).unwrap();
    assert_eq!(view.current_state(), expect(&[(1, 3), (2, 1), (3, 1)]));

    // The last row of group 3 departs and the group's aggregate row disappears
    // with it.
    memory.remove(&row(3, 4)).unwrap();
    assert_eq!(view.current_state(), expect(&[(1, 3), (2, 1)]));
}

#[test]
fn per_group_numeric_aggregates_recompute_on_change() {
    let memory = Memory::new(
        vec![order(1, 1, 10.0), order(2, 1, 20.0), order(3, 2, 5.0)],
        "id",
    )
    .unwrap();

    let sums = SumGroupBy::new(
        GroupBy::new(memory.connect(), &["userId"], by_column("id")).unwrap(),
        "amount",
    )
    .unwrap();
    let sum_view = View::new(sums, by_column("userId")).unwrap();

    let mins = MinGroupBy::new(
        GroupBy::new(memory.connect(), &["userId"], by_column("id")).unwrap(),
        "amount",
    )
    .unwrap();
    let min_view = View::new(mins, by_column("userId")).unwrap();

    let maxes = MaxGroupBy::new(
        GroupBy::new(memory.connect(), &["userId"], by_column("id")).unwrap(),
        "amount",
    )
    .unwrap();
    let max_view = View::new(maxes, by_column("userId")).unwrap();

    let avgs = AvgGroupBy::new(
        GroupBy::new(memory.connect(), &["userId"], by_column("id")).unwrap(),
        "amount",
    )
    .unwrap();
    let avg_view = View::new(avgs, by_column("userId")).unwrap();

    assert_eq!(
        sum_view.materialize(),
        vec![agg_row(1, "sum", json!(30.0)), agg_row(2, "sum", json!(5.0))]
    );
    assert_eq!(
        min_view.materialize(),
        vec![agg_row(1, "min", json!(10.0)), agg_row(2, "min", json!(5.0))]
    );
    assert_eq!(
        max_view.materialize(),
        vec![agg_row(1, "max", json!(20.0)), agg_row(2, "max", json!(5.0))]
    );
    assert_eq!(
        avg_view.materialize(),
        vec![agg_row(1, "avg", json!(15.0)), agg_row(2, "avg", json!(5.0))]
    );

    memory.add(order(4, 1, 60.0)).unwrap();
    memory.remove(&order(1, 0, 0.0)).unwrap();

    assert_eq!(
        sum_view.current_state(),
        vec![agg_row(1, "sum", json!(80.0)), agg_row(2, "sum", json!(5.0))]
    );
    assert_eq!(
        min_view.current_state(),
        vec![agg_row(1, "min", json!(20.0)), agg_row(2, "min", json!(5.0))]
    );
    assert_eq!(
        max_view.current_state(),
        vec![agg_row(1, "max", json!(60.0)), agg_row(2, "max", json!(5.0))]
    );
    assert_eq!(
        avg_view.current_state(),
        vec![agg_row(1, "avg", json!(40.0)), agg_row(2, "avg", json!(5.0))]
    );
}

#[test]
fn per_group_array_and_json_aggregates() {
    let tag = |id: i64, user: i64, name: &str| -> OwnedRow {
        [("id", json!(id)), ("userId", json!(user)), ("name", json!(name))]
            .into_iter()
            .collect()
    };
    let memory = Memory::new(vec![tag(1, 1, "a"), tag(2, 1, "b"), tag(3, 2, "c")], "id").unwrap();

    let arrays = ArrayAggGroupBy::new(
        GroupBy::new(memory.connect(), &["userId"], by_column("id")).unwrap(),
        "name",
    )
    .unwrap();
    let array_view = View::new(arrays, by_column("userId")).unwrap();

    let jsons = JsonAggGroupBy::new(
        GroupBy::new(memory.connect(), &["userId"], by_column("id")).unwrap(),
        JsonSpec::Column("name".into()),
    )
    .unwrap();
    let json_view = View::new(jsons, by_column("userId")).unwrap();

    assert_eq!(
        array_view.materialize(),
        vec![
            agg_row(1, "array_agg", json!(["a", "b"])),
            agg_row(2, "array_agg", json!(["c"])),
        ]
    );
    assert_eq!(
        json_view.materialize(),
        vec![
            agg_row(1, "json_agg", json!(["a", "b"])),
            agg_row(2, "json_agg", json!(["c"])),
        ]
    );

    memory.remove(&tag(1, 0, "")).unwrap();
    assert_eq!(
        array_view.current_state(),
        vec![
            agg_row(1, "array_agg", json!(["b"])),
            agg_row(2, "array_agg", json!(["c"])),
        ]
    );
    assert_eq!(
        json_view.current_state(),
        vec![
            agg_row(1, "json_agg", json!(["b"])),
            agg_row(2, "json_agg", json!(["c"])),
        ]
    );
}

#[test]
fn multi_row_combine_pairs_per_group_aggregates() {
    let memory = Memory::new(
        vec![order(1, 1, 10.0), order(2, 1, 20.0), order(3, 2, 5.0)],
        "id",
    )
    .unwrap();

    let counts = CountGroupBy::new(
        GroupBy::new(memory.connect(), &["userId"], by_column("id")).unwrap(),
    )
    .unwrap();
    let sums = SumGroupBy::new(
        GroupBy::new(memory.connect(), &["userId"], by_column("id")).unwrap(),
        "amount",
    )
    .unwrap();

    let combined = MultiRowCombine::new(
        counts,
        sums,
        &["userId"],
        |count: &OwnedRow, sum: &OwnedRow| {
            OwnedRow::new()
                .with("userId", count.column("userId"))
                .with("count", count.column("count"))
                .with("sum", sum.column("sum"))
        },
    )
    .unwrap();
    let view = View::new(combined, by_column("userId")).unwrap();

    let expect = |rows: &[(i64, i64, f64)]| -> Vec<OwnedRow> {
        rows.iter()
            .map(|&(u, c, s)| {
                OwnedRow::new()
                    .with("userId", json!(u))
                    .with("count", json!(c))
                    .with("sum", json!(s))
            })
            .collect()
    };

    assert_eq!(view.materialize(), expect(&[(1, 2, 30.0), (2, 1, 5.0)]));

    memory.add(order(4, 3, 7.0)).unwrap();
    assert_eq!(
        view.current_state(),
        expect(&[(1, 2, 30.0), (2, 1, 5.0), (3, 1, 7.0)])
    );

    memory.remove(&order(3, 0, 0.0)).unwrap();
    assert_eq!(view.current_state(), expect(&[(1, 2, 30.0), (3, 1, 7.0)]));
}

#[test]
fn grouped_output_survives_repeated_materialization() {
    let memory = Memory::new(vec![row(1, 1), row(2, 2)], "id").unwrap();
    let groups = GroupBy::new(memory.connect(), &["userId"], by_column("id")).unwrap();
    let counts = CountGroupBy::new(groups).unwrap();
    let view = View::new(counts, by_column("userId")).unwrap();

    let first = view.materialize();
    memory.add(row(2, 3)).unwrap();
    let incremental = view.current_state();
    let rebuilt = view.materialize();
    assert_ne!(first, incremental);
    assert_eq!(incremental, rebuilt);
}
