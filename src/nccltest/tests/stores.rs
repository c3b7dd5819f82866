use nccltest::history::{HistoryError, HistoryStore};
use nccltest::roster::{RosterError, RosterStore};

#[test]
fn roster_round_trip_drops_blank_lines() {
    let dir = tempfile::tempdir().unwrap();
    let rosters = RosterStore::new(dir.path().join("iplist"));

    std::fs::create_dir_all(rosters.dir()).unwrap();
    std::fs::write(rosters.dir().join("h200"), "10.0.0.1\n\n  10.0.0.2  \n\n").unwrap();
    assert_eq!(rosters.read("h200").unwrap(), vec!["10.0.0.1", "10.0.0.2"]);

    let addrs = vec!["10.0.1.1".to_owned(), " ".to_owned(), "10.0.1.2".to_owned()];
    rosters.save("a100", &addrs).unwrap();
    assert_eq!(rosters.read("a100").unwrap(), vec!["10.0.1.1", "10.0.1.2"]);
    assert_eq!(
        std::fs::read_to_string(rosters.dir().join("a100")).unwrap(),
        "10.0.1.1\n10.0.1.2\n"
    );

    let mut names: Vec<_> = rosters.list().unwrap().into_iter().map(|f| f.filename).collect();
    names.sort();
    assert_eq!(names, vec!["a100", "h200"]);
}

#[test]
fn missing_roster_is_empty() {
    let dir = tempfile::tempdir().unwrap();
    let rosters = RosterStore::new(dir.path().join("iplist"));
    assert!(rosters.read("default").unwrap().is_empty());
    assert!(rosters.list().unwrap().is_empty());
}

#[test]
fn roster_names_cannot_escape() {
    let dir = tempfile::tempdir().unwrap();
    let rosters = RosterStore::new(dir.path().join("iplist"));
    for name in &["", "..", "../passwd", "a/b"] {
        assert!(matches!(rosters.read(name), Err(RosterError::InvalidName(_))), "{}", name);
        assert!(matches!(rosters.save(name, &[]), Err(RosterError::InvalidName(_))), "{}", name);
    }
}

#[test]
fn roster_delete() {
    let dir = tempfile::tempdir().unwrap();
    let rosters = RosterStore::new(dir.path().join("iplist"));
    rosters.save("h200", &["10.0.0.1".to_owned()]).unwrap();

    rosters.delete("h200").unwrap();
    assert!(rosters.list().unwrap().is_empty());
    assert!(rosters.read("h200").unwrap().is_empty());
    assert!(matches!(rosters.delete("h200"), Err(RosterError::NotFound(_))));
    assert!(matches!(rosters.delete("../h200"), Err(RosterError::InvalidName(_))));
}

#[test]
fn history_save_list_read_delete() {
    logging::init_log();
    let dir = tempfile::tempdir().unwrap();
    let history = HistoryStore::new(dir.path().join("history"));
    assert!(history.list().unwrap().is_empty());

    let first = history.save("first run\n").unwrap();
    assert!(first.ends_with(".txt"));
    // YYYYmmdd_HHMMSS.txt
    assert_eq!(first.len(), "20240101_120000.txt".len());
    assert_eq!(history.read(&first).unwrap(), "first run\n");

    history.delete(&first).unwrap();
    assert!(matches!(history.read(&first), Err(HistoryError::NotFound(_))));
    assert!(matches!(history.delete(&first), Err(HistoryError::NotFound(_))));
    assert!(history.list().unwrap().is_empty());
}

#[test]
fn history_names_never_collide() {
    let dir = tempfile::tempdir().unwrap();
    let history = HistoryStore::new(dir.path().join("history"));

    let names: Vec<_> = (0..3)
        .map(|i| history.save(&format!("run {}", i)).unwrap())
        .collect();
    let mut unique = names.clone();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), 3);
    for (i, name) in names.iter().enumerate() {
        assert_eq!(history.read(name).unwrap(), format!("run {}", i));
    }
    assert_eq!(history.list().unwrap().len(), 3);
}

#[test]
fn history_ignores_foreign_files() {
    let dir = tempfile::tempdir().unwrap();
    let history = HistoryStore::new(dir.path().join("history"));
    history.save("x").unwrap();
    std::fs::write(history.dir().join("notes.md"), "not a transcript").unwrap();
    assert_eq!(history.list().unwrap().len(), 1);
}

#[test]
fn history_names_cannot_escape() {
    let dir = tempfile::tempdir().unwrap();
    let history = HistoryStore::new(dir.path().join("history"));
    assert!(matches!(history.read("../../etc/passwd"), Err(HistoryError::InvalidName(_))));
    assert!(matches!(history.delete(".."), Err(HistoryError::InvalidName(_))));
}
