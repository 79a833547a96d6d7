//! View materialization, duplicates, and subscriptions.

use std::cell::RefCell;
use std::rc::Rc;

use delta_view::operators::Project;
use delta_view::{by_column, Memory, OwnedRow, View};
use serde_json::json;

fn item(id: i64, value: i64) -> OwnedRow {
    [("id", json!(id)), ("value", json!(value))].into_iter().collect()
}

fn projected(value: i64) -> OwnedRow {
    [("value", json!(value))].into_iter().collect()
}

#[test]
fn non_injective_projection_preserves_duplicates() {
    let memory = Memory::new(vec![item(1, 10), item(2, 10), item(3, 20)], "id").unwrap();
    let project = Project::of_columns(memory.connect(), &["value"]).unwrap();
    let view = View::new(project, by_column("value")).unwrap();

    assert_eq!(
        view.materialize(),
        vec![projected(10), projected(10), projected(20)]
    );

    // Dropping one of the two colliding rows leaves one copy behind.
    memory.remove(&item(1, 0)).unwrap();
    assert_eq!(view.current_state(), vec![projected(10), projected(20)]);
}

#[test]
fn subscribers_get_the_current_snapshot_immediately_and_on_every_change() {
    let memory = Memory::new(vec![item(1, 10)], "id").unwrap();
    let view = View::new(memory.connect(), by_column("id")).unwrap();
    view.materialize();

    let seen: Rc<RefCell<Vec<Vec<OwnedRow>>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = seen.clone();
    let subscription = view.subscribe(move |rows| sink.borrow_mut().push(rows.to_vec()));

    memory.add(item(2, 20)).unwrap();
    memory.remove(&item(1, 0)).unwrap();

    assert_eq!(
        *seen.borrow(),
        vec![
            vec![item(1, 10)],
            vec![item(1, 10), item(2, 20)],
            vec![item(2, 20)],
        ]
    );

    subscription.unsubscribe();
    memory.add(item(3, 30)).unwrap();
    assert_eq!(seen.borrow().len(), 3);
}

#[test]
fn current_state_tracks_pushes_without_repulling() {
    let memory = Memory::new(vec![item(1, 10)], "id").unwrap();
    let view = View::new(memory.connect(), by_column("id")).unwrap();

    assert_eq!(view.materialize(), vec![item(1, 10)]);
    memory.update(&item(1, 0), |r| r.clone().with("value", json!(11))).unwrap();
    assert_eq!(view.current_state(), vec![item(1, 11)]);
    assert_eq!(view.current_state(), view.materialize());
}

#[test]
fn disconnect_clears_state_and_stops_notifications() {
    let memory = Memory::new(vec![item(1, 10)], "id").unwrap();
    let view = View::new(memory.connect(), by_column("id")).unwrap();
    view.materialize();

    let calls = Rc::new(RefCell::new(0usize));
    let counter = calls.clone();
    let _subscription = view.subscribe(move |_| *counter.borrow_mut() += 1);
    assert_eq!(*calls.borrow(), 1);

    view.disconnect();
    memory.add(item(2, 20)).unwrap();
    assert_eq!(*calls.borrow(), 1, "disconnected view must not notify");
    assert!(view.current_state().is_empty());
}
