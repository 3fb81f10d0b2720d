//! End-to-end scenarios over the session bridge: linear history,
//! conflicting merges, merge abort, feature-version lockout, and remote
//! fetch/push flows.

use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;
use tributary_core::db::Database;
use tributary_core::model::{Column, ModelError, Schema, Signature};
use tributary_core::value::{SqlType, Value};
use tributary_sql::procedures::ProcedureResult;
use tributary_sql::system_tables;
use tributary_sql::{Session, SessionConfig, SessionError};

fn identity() -> Signature {
    Signature::new("Tester", "tester@example.com", chrono::Utc::now())
}

fn config() -> SessionConfig {
    SessionConfig {
        user_name: "Tester".to_string(),
        user_email: "tester@example.com".to_string(),
        autocommit: true,
    }
}

fn open_session(dir: &Path) -> (Arc<Database>, Session) {
    let db = Arc::new(Database::init(dir, &identity()).unwrap());
    let session = Session::new(db.clone(), config()).unwrap();
    (db, session)
}

fn int_col(name: &str, tag: u64, nullable: bool) -> Column {
    Column {
        name: name.to_string(),
        ty: SqlType::Int,
        nullable,
        default: None,
        comment: String::new(),
        tag,
    }
}

/// `t(pk int primary key, v int)`
fn two_col_schema() -> Schema {
    Schema::new(vec![int_col("pk", 1, false), int_col("v", 2, true)], vec![1])
}

/// `t2(a int primary key, b int, c int)`
fn three_col_schema() -> Schema {
    Schema::new(
        vec![
            int_col("a", 1, false),
            int_col("b", 2, true),
            int_col("c", 3, true),
        ],
        vec![1],
    )
}

async fn call(session: &mut Session, name: &str, args: &[&str]) -> ProcedureResult {
    session.call_procedure(name, args).await.unwrap()
}

// ----------------------------------------------------------------------
// Scenario 1: linear commit + log
// ----------------------------------------------------------------------

#[tokio::test]
async fn linear_commit_and_log() {
    let dir = tempdir().unwrap();
    let (_db, mut session) = open_session(dir.path());

    session
        .create_table("t", Schema::new(vec![int_col("pk", 1, false)], vec![1]))
        .unwrap();
    session.insert_row("t", vec![Value::Int(1)]).unwrap();

    let first = call(&mut session, "dolt_commit", &["-am", "one"]).await;
    let first_hash = first.hash().unwrap().to_string();

    let second = call(
        &mut session,
        "dolt_commit",
        &["--allow-empty", "-m", "two"],
    )
    .await;
    let second_hash = second.hash().unwrap().to_string();

    let log = system_tables::dolt_log(&session, &[]).unwrap();
    assert_eq!(log.len(), 3);
    // Newest first; commit_order is the stored topological height.
    let orders: Vec<u64> = log.iter().map(|row| row.commit_order).collect();
    assert_eq!(orders, vec![2, 1, 0]);
    assert_eq!(log[0].commit_hash, second_hash);
    assert_eq!(log[0].message, "two");
    assert_eq!(log[1].commit_hash, first_hash);
    assert_eq!(log[1].message, "one");

    // HEAD equals what dolt_commit reported.
    assert_eq!(session.head().to_hex(), second_hash);
    // The oneline display form walks the same three rows.
    let oneline = system_tables::dolt_log(&session, &["--oneline"]).unwrap();
    assert_eq!(oneline.len(), 3);

    // Ancestry rows: one NULL-parent row for the initial commit.
    let ancestors = system_tables::dolt_commit_ancestors(&session).unwrap();
    assert_eq!(ancestors.len(), 3);
    assert_eq!(
        ancestors
            .iter()
            .filter(|row| row.parent_hash.is_none())
            .count(),
        1
    );
}

#[tokio::test]
async fn commit_argument_validation() {
    let dir = tempdir().unwrap();
    let (_db, mut session) = open_session(dir.path());

    // Missing message.
    let err = session
        .call_procedure("dolt_commit", &["--allow-empty"])
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::MissingMessage));

    // Mutually exclusive emptiness flags.
    let err = session
        .call_procedure(
            "dolt_commit",
            &["--allow-empty", "--skip-empty", "-m", "x"],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::AllowSkipEmpty));

    // Unknown options are rejected outright.
    let err = session
        .call_procedure("dolt_commit", &["--frobnicate", "-m", "x"])
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::UnknownOption(_)));

    // Nothing staged: plain commit errors, --skip-empty succeeds quietly.
    let err = session
        .call_procedure("dolt_commit", &["-m", "x"])
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::NothingToCommit));
    let skipped = call(&mut session, "dolt_commit", &["--skip-empty", "-m", "x"]).await;
    assert_eq!(skipped, ProcedureResult::Skipped);

    // Short aliases reach the same procedure.
    let err = session
        .call_procedure("dcommit", &["-m", "x"])
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::NothingToCommit));
}

// ----------------------------------------------------------------------
// Scenario 2: three-way merge with conflict
// ----------------------------------------------------------------------

#[tokio::test]
async fn divergent_update_conflicts_and_blocks_commit() {
    let dir = tempdir().unwrap();
    let (_db, mut session) = open_session(dir.path());

    session.create_table("t", two_col_schema()).unwrap();
    session
        .insert_row("t", vec![Value::Int(1), Value::Int(1)])
        .unwrap();
    call(&mut session, "dolt_commit", &["-Am", "base"]).await;

    session.create_branch("left", None).unwrap();
    session.create_branch("right", None).unwrap();

    call(&mut session, "dolt_checkout", &["left"]).await;
    session
        .update_row("t", vec![Value::Int(1), Value::Int(2)])
        .unwrap();
    call(&mut session, "dolt_commit", &["-am", "left edit"]).await;

    call(&mut session, "dolt_checkout", &["right"]).await;
    session
        .update_row("t", vec![Value::Int(1), Value::Int(3)])
        .unwrap();
    call(&mut session, "dolt_commit", &["-am", "right edit"]).await;

    call(&mut session, "dolt_checkout", &["left"]).await;
    let result = call(&mut session, "dolt_merge", &["right"]).await;
    match result {
        ProcedureResult::Merge {
            conflicts,
            fast_forward,
            ..
        } => {
            assert_eq!(conflicts, 1);
            assert!(!fast_forward);
        }
        other => panic!("expected merge result, got {other:?}"),
    }

    // The working set is in the merging state.
    assert!(session.merge_state().is_some());

    // dolt_conflicts reports the table; dolt_conflicts_t has the triple.
    let summary = system_tables::dolt_conflicts(&session).unwrap();
    assert_eq!(summary.len(), 1);
    assert_eq!(summary[0].table, "t");
    assert_eq!(summary[0].num_conflicts, 1);

    let rows = system_tables::dolt_conflicts_table(&session, "t").unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].base_row, Some(vec![Value::Int(1), Value::Int(1)]));
    assert_eq!(rows[0].our_row, Some(vec![Value::Int(1), Value::Int(2)]));
    assert_eq!(rows[0].their_row, Some(vec![Value::Int(1), Value::Int(3)]));

    // Committing without resolving is refused.
    let err = session
        .call_procedure("dolt_commit", &["-am", "merge attempt"])
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::UnresolvedConflicts(_)));

    // Resolve with theirs, then the merge commit goes through with two
    // parents in (ours, theirs) order.
    call(
        &mut session,
        "dolt_conflicts_resolve",
        &["--theirs", "t"],
    )
    .await;
    let rows = session.scan_table("t").unwrap();
    assert_eq!(rows, vec![vec![Value::Int(1), Value::Int(3)]]);

    let merged = call(&mut session, "dolt_commit", &["-am", "merged"]).await;
    let merged_hash = merged.hash().unwrap().to_string();
    let log = system_tables::dolt_log(&session, &[]).unwrap();
    assert_eq!(log[0].commit_hash, merged_hash);
    assert_eq!(log[0].parents.len(), 2);
    assert!(session.merge_state().is_none());
}

// ----------------------------------------------------------------------
// Scenario 3: merge --abort preserves unrelated dirty state
// ----------------------------------------------------------------------

#[tokio::test]
async fn merge_abort_preserves_unrelated_dirty_tables() {
    let dir = tempdir().unwrap();
    let (_db, mut session) = open_session(dir.path());

    session.create_table("t1", two_col_schema()).unwrap();
    session.create_table("t2", three_col_schema()).unwrap();
    session
        .insert_row("t1", vec![Value::Int(1), Value::Int(1)])
        .unwrap();
    call(&mut session, "dolt_commit", &["-Am", "base"]).await;

    // A branch that edits only t1.
    session.create_branch("right", None).unwrap();
    call(&mut session, "dolt_checkout", &["right"]).await;
    session
        .update_row("t1", vec![Value::Int(1), Value::Int(2)])
        .unwrap();
    call(&mut session, "dolt_commit", &["-am", "right edit"]).await;

    // Main edits t1 divergently (committed) and t2 (left dirty).
    call(&mut session, "dolt_checkout", &["main"]).await;
    session
        .update_row("t1", vec![Value::Int(1), Value::Int(3)])
        .unwrap();
    call(&mut session, "dolt_commit", &["-am", "main edit"]).await;
    session
        .insert_row("t2", vec![Value::Int(9), Value::Int(9), Value::Int(9)])
        .unwrap();

    let result = call(&mut session, "dolt_merge", &["right"]).await;
    match result {
        ProcedureResult::Merge { conflicts, .. } => assert_eq!(conflicts, 1),
        other => panic!("expected merge result, got {other:?}"),
    }
    // The dirty t2 insert survived the merge starting.
    assert_eq!(
        session.scan_table("t2").unwrap(),
        vec![vec![Value::Int(9), Value::Int(9), Value::Int(9)]]
    );

    call(&mut session, "dolt_merge", &["--abort"]).await;
    assert!(session.merge_state().is_none());

    // t2 keeps the uncommitted row; t1 is back at its pre-merge state.
    assert_eq!(
        session.scan_table("t2").unwrap(),
        vec![vec![Value::Int(9), Value::Int(9), Value::Int(9)]]
    );
    assert_eq!(
        session.scan_table("t1").unwrap(),
        vec![vec![Value::Int(1), Value::Int(3)]]
    );

    // Status: clean except for the unstaged t2 change.
    let status = system_tables::dolt_status(&session).unwrap();
    assert_eq!(status.len(), 1);
    assert_eq!(status[0].table_name, "t2");
    assert!(!status[0].staged);
    assert_eq!(status[0].status, "modified");
}

// ----------------------------------------------------------------------
// Scenario 4: feature-version lockout
// ----------------------------------------------------------------------

#[tokio::test]
async fn newer_writer_locks_out_older_reader() {
    let dir = tempdir().unwrap();

    // A writer at feature version 20 populates the database.
    {
        let db = Arc::new(
            Database::init_with_feature_version(dir.path(), &identity(), 20).unwrap(),
        );
        let mut session = Session::new(db, config()).unwrap();
        session.create_table("t", two_col_schema()).unwrap();
        session
            .insert_row("t", vec![Value::Int(1), Value::Int(1)])
            .unwrap();
        session
            .call_procedure("dolt_commit", &["-Am", "from the future"])
            .await
            .unwrap();
        // Autocommit statement hook rewrote the working root under the
        // writer's feature version.
        session.touch_working_set().unwrap();
    }

    // A reader that only supports feature version 10 is locked out.
    let db = Arc::new(Database::open_with_feature_version(dir.path(), 10).unwrap());
    let session = Session::new(db, config()).unwrap();
    let err = session.scan_table("t").unwrap_err();
    match err {
        SessionError::Model(ModelError::FeatureTooNew { found, supported }) => {
            assert_eq!(found, 20);
            assert_eq!(supported, 10);
        }
        other => panic!("expected FeatureTooNew, got {other}"),
    }
    // The error carries an upgrade pointer.
    assert!(err.to_string().contains("upgrade"));

    // An up-to-date reader still sees the data unchanged.
    drop(session);
    let db = Arc::new(Database::open_with_feature_version(dir.path(), 20).unwrap());
    let session = Session::new(db, config()).unwrap();
    assert_eq!(
        session.scan_table("t").unwrap(),
        vec![vec![Value::Int(1), Value::Int(1)]]
    );
}

// ----------------------------------------------------------------------
// Scenario 5: fetch with --prune
// ----------------------------------------------------------------------

#[tokio::test]
async fn fetch_prune_removes_only_this_remotes_stale_refs() {
    let remote_dir = tempdir().unwrap();
    let remote_db = Arc::new(Database::init(remote_dir.path(), &identity()).unwrap());
    let head = remote_db.head_commit("main").unwrap().0;
    remote_db.create_branch("b1", head).unwrap();
    remote_db.create_branch("b2", head).unwrap();

    let local_dir = tempdir().unwrap();
    let (local_db, mut session) = open_session(local_dir.path());
    local_db
        .add_remote(tributary_core::remote::Remote::new(
            "origin",
            remote_dir.path().to_str().unwrap(),
        ))
        .unwrap();

    let fetched = call(&mut session, "dolt_fetch", &["origin"]).await;
    match fetched {
        ProcedureResult::Fetch { refs_updated, .. } => assert_eq!(refs_updated, 3),
        other => panic!("expected fetch result, got {other:?}"),
    }
    let tracked = system_tables::dolt_remote_branches(&session).unwrap();
    assert_eq!(tracked.len(), 3);

    // A ref under another remote's namespace must survive pruning.
    local_db
        .refs()
        .force_update(
            &tributary_core::refs::RefName::remote_tracking("other_remote", "main"),
            head,
        )
        .unwrap();

    remote_db.delete_branch("b1").unwrap();
    let pruned = call(&mut session, "dolt_fetch", &["--prune", "origin"]).await;
    match pruned {
        ProcedureResult::Fetch { refs_pruned, .. } => assert_eq!(refs_pruned, 1),
        other => panic!("expected fetch result, got {other:?}"),
    }

    let names: Vec<String> = system_tables::dolt_remote_branches(&session)
        .unwrap()
        .into_iter()
        .map(|row| row.name)
        .collect();
    assert!(!names.contains(&"remotes/origin/b1".to_string()));
    assert!(names.contains(&"remotes/origin/b2".to_string()));
    assert!(names.contains(&"remotes/other_remote/main".to_string()));

    // --prune with an explicit refspec is a user error.
    let err = session
        .call_procedure("dolt_fetch", &["--prune", "origin", "main"])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SessionError::Remote(tributary_core::remote::RemoteError::PruneWithRefspec)
    ));
}

// ----------------------------------------------------------------------
// Scenario 6: force-fetch after a remote rewrite
// ----------------------------------------------------------------------

#[tokio::test]
async fn force_fetch_after_remote_history_rewrite() {
    let remote_dir = tempdir().unwrap();

    // Remote history: initial commit, then a commit X adding table t.
    let remote_db = Arc::new(Database::init(remote_dir.path(), &identity()).unwrap());
    let initial = remote_db.head_commit("main").unwrap().0;
    let commit_x = {
        let mut remote_session = Session::new(remote_db.clone(), config()).unwrap();
        remote_session.create_table("t", two_col_schema()).unwrap();
        remote_session
            .insert_row("t", vec![Value::Int(1), Value::Int(1)])
            .unwrap();
        remote_session
            .call_procedure("dolt_commit", &["-Am", "X"])
            .await
            .unwrap()
            .hash()
            .unwrap()
            .to_string()
    };

    let local_dir = tempdir().unwrap();
    let (local_db, mut session) = open_session(local_dir.path());
    local_db
        .add_remote(tributary_core::remote::Remote::new(
            "origin",
            remote_dir.path().to_str().unwrap(),
        ))
        .unwrap();
    call(&mut session, "dolt_fetch", &["origin", "main"]).await;
    let tracking = tributary_core::refs::RefName::remote_tracking("origin", "main");
    assert_eq!(
        local_db.refs().resolve(&tracking).unwrap().to_hex(),
        commit_x
    );

    // The remote rewrites main back to the initial commit (as a force
    // push would).
    remote_db
        .refs()
        .force_update(&tributary_core::refs::RefName::branch("main"), initial)
        .unwrap();

    // A plain fetch refuses the non-fast-forward update...
    let err = session
        .call_procedure("dolt_fetch", &["origin", "main"])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SessionError::Remote(tributary_core::remote::RemoteError::NonFastForward(_))
    ));
    assert_eq!(
        local_db.refs().resolve(&tracking).unwrap().to_hex(),
        commit_x
    );

    // ...and --force takes it.
    call(&mut session, "dolt_fetch", &["--force", "origin", "main"]).await;
    assert_eq!(local_db.refs().resolve(&tracking).unwrap(), initial);

    // The diff between the two fetched points shows t's row removed.
    let diff = system_tables::dolt_commit_diff_table(
        &session,
        "t",
        Some(&commit_x),
        Some(&initial.to_hex()),
    )
    .unwrap();
    assert_eq!(diff.len(), 1);
    assert_eq!(diff[0].diff_type, "removed");
    assert_eq!(
        diff[0].from_row,
        Some(vec![Value::Int(1), Value::Int(1)])
    );
    assert!(diff[0].to_row.is_none());

    // Both endpoints are required for commit-diff queries.
    let err =
        system_tables::dolt_commit_diff_table(&session, "t", Some(&commit_x), None).unwrap_err();
    assert!(matches!(err, SessionError::Usage(_)));
}

// ----------------------------------------------------------------------
// Push round trip
// ----------------------------------------------------------------------

#[tokio::test]
async fn push_publishes_local_commits() {
    let origin_dir = tempdir().unwrap();
    let origin_db = Arc::new(Database::init(origin_dir.path(), &identity()).unwrap());

    let local_dir = tempdir().unwrap();
    let local_db = Arc::new(
        Database::clone(
            local_dir.path(),
            "origin",
            origin_dir.path().to_str().unwrap(),
            tributary_core::FEATURE_VERSION,
            &tributary_core::Cancel::new(),
        )
        .await
        .unwrap(),
    );
    let mut session = Session::new(local_db.clone(), config()).unwrap();

    session.create_table("t", two_col_schema()).unwrap();
    session
        .insert_row("t", vec![Value::Int(7), Value::Int(7)])
        .unwrap();
    let pushed_hash = call(&mut session, "dolt_commit", &["-Am", "local work"])
        .await
        .hash()
        .unwrap()
        .to_string();

    call(&mut session, "dolt_push", &["origin", "main"]).await;
    assert_eq!(
        origin_db.refs().resolve(&tributary_core::refs::RefName::branch("main")).unwrap().to_hex(),
        pushed_hash
    );

    // The origin can read the pushed rows directly.
    let origin_session = Session::new(origin_db.clone(), config()).unwrap();
    drop(origin_session);
    let (_, commit) = origin_db.head_commit("main").unwrap();
    let root = tributary_core::model::RootValue::load(
        &*origin_db.store(),
        &commit.root,
        tributary_core::FEATURE_VERSION,
    )
    .unwrap();
    assert!(root.has_table("t"));
}

// ----------------------------------------------------------------------
// Supporting surfaces
// ----------------------------------------------------------------------

#[tokio::test]
async fn history_and_diff_system_tables() {
    let dir = tempdir().unwrap();
    let (_db, mut session) = open_session(dir.path());

    session.create_table("t", two_col_schema()).unwrap();
    session
        .insert_row("t", vec![Value::Int(1), Value::Int(1)])
        .unwrap();
    call(&mut session, "dolt_commit", &["-Am", "one"]).await;
    session
        .update_row("t", vec![Value::Int(1), Value::Int(2)])
        .unwrap();
    call(&mut session, "dolt_commit", &["-am", "two"]).await;
    // A dirty working edit on top.
    session
        .insert_row("t", vec![Value::Int(5), Value::Int(5)])
        .unwrap();

    // dolt_history_t: one row per commit that has the table.
    let history = system_tables::dolt_history_table(&session, "t").unwrap();
    assert_eq!(history.len(), 2);

    // dolt_diff_t: WORKING sentinel carries the dirty insert; the commit
    // transitions carry the update and the original insert.
    let diff = system_tables::dolt_diff_table(&session, "t").unwrap();
    let working: Vec<_> = diff
        .iter()
        .filter(|row| row.to_commit == system_tables::WORKING)
        .collect();
    assert_eq!(working.len(), 1);
    assert_eq!(working[0].diff_type, "added");
    assert_eq!(
        working[0].to_row,
        Some(vec![Value::Int(5), Value::Int(5)])
    );
    assert!(diff
        .iter()
        .any(|row| row.diff_type == "modified"
            && row.to_row == Some(vec![Value::Int(1), Value::Int(2)])));
    assert!(diff
        .iter()
        .any(|row| row.diff_type == "added"
            && row.to_row == Some(vec![Value::Int(1), Value::Int(1)])));
}

#[tokio::test]
async fn branches_tags_and_status_tables() {
    let dir = tempdir().unwrap();
    let (_db, mut session) = open_session(dir.path());

    session.create_table("t", two_col_schema()).unwrap();
    call(&mut session, "dolt_commit", &["-Am", "create"]).await;
    call(&mut session, "dolt_branch", &["feature"]).await;
    call(&mut session, "dolt_tag", &["v1", "-m", "first release"]).await;

    let branches = system_tables::dolt_branches(&session).unwrap();
    let names: Vec<&str> = branches.iter().map(|b| b.name.as_str()).collect();
    assert_eq!(names, vec!["feature", "main"]);
    assert_eq!(branches[0].latest_commit_message, "create");

    let tags = system_tables::dolt_tags(&session).unwrap();
    assert_eq!(tags.len(), 1);
    assert_eq!(tags[0].tag_name, "v1");
    assert_eq!(tags[0].message, "first release");
    assert_eq!(tags[0].tag_hash, session.head().to_hex());

    // Never-fetched database: empty remote branches, not an error.
    assert!(system_tables::dolt_remote_branches(&session)
        .unwrap()
        .is_empty());

    // Working change shows unstaged; staging moves it.
    session
        .insert_row("t", vec![Value::Int(1), Value::Int(1)])
        .unwrap();
    let status = system_tables::dolt_status(&session).unwrap();
    assert_eq!(status.len(), 1);
    assert!(!status[0].staged);
    call(&mut session, "dolt_add", &["t"]).await;
    let status = system_tables::dolt_status(&session).unwrap();
    assert_eq!(status.len(), 1);
    assert!(status[0].staged);
}

#[tokio::test]
async fn schema_catalog_and_its_history() {
    let dir = tempdir().unwrap();
    let (_db, mut session) = open_session(dir.path());

    session
        .put_catalog_entry(tributary_core::model::CatalogEntry {
            kind: tributary_core::model::CatalogKind::View,
            name: "active_users".to_string(),
            definition: "select * from users where active = 1".to_string(),
            created_at_millis: 1_700_000_000_000,
        })
        .unwrap();
    session
        .put_procedure_entry(tributary_core::model::ProcedureEntry {
            name: "cleanup".to_string(),
            create_stmt: "create procedure cleanup() delete from logs".to_string(),
            created_at_millis: 1_700_000_000_000,
            modified_at_millis: 1_700_000_000_000,
        })
        .unwrap();

    let schemas = system_tables::dolt_schemas(&session).unwrap();
    assert_eq!(schemas.len(), 1);
    assert_eq!(schemas[0].type_name, "view");
    assert_eq!(schemas[0].name, "active_users");

    let procedures = system_tables::dolt_procedures(&session).unwrap();
    assert_eq!(procedures.len(), 1);
    assert_eq!(procedures[0].name, "cleanup");

    // Once committed, the catalog shows up in the history views.
    call(&mut session, "dolt_commit", &["-Am", "catalog"]).await;
    let history = system_tables::dolt_schemas_history(&session).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].entry.name, "active_users");
    let history = system_tables::dolt_procedures_history(&session).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].entry.name, "cleanup");
}

#[tokio::test]
async fn duplicate_keys_and_ignore_semantics() {
    let dir = tempdir().unwrap();
    let (_db, mut session) = open_session(dir.path());

    session.create_table("t", two_col_schema()).unwrap();
    session
        .insert_row("t", vec![Value::Int(1), Value::Int(1)])
        .unwrap();

    // A duplicate primary key fails the statement with the MySQL code
    // and leaves the working root unchanged.
    let before = session.working_hash();
    let err = session
        .insert_rows(
            "t",
            vec![
                vec![Value::Int(2), Value::Int(2)],
                vec![Value::Int(1), Value::Int(99)],
            ],
            false,
        )
        .unwrap_err();
    assert!(matches!(err, SessionError::DuplicateKey(_)));
    assert_eq!(err.mysql_code(), Some(1062));
    assert_eq!(session.working_hash(), before);
    assert_eq!(session.scan_table("t").unwrap().len(), 1);

    // With IGNORE, the offending row is skipped and counted.
    let skipped = session
        .insert_rows(
            "t",
            vec![
                vec![Value::Int(2), Value::Int(2)],
                vec![Value::Int(1), Value::Int(99)],
            ],
            true,
        )
        .unwrap();
    assert_eq!(skipped, 1);
    let rows = session.scan_table("t").unwrap();
    assert_eq!(rows.len(), 2);
    // The original row 1 was not clobbered.
    assert_eq!(rows[0], vec![Value::Int(1), Value::Int(1)]);
}

#[tokio::test]
async fn committer_identity_env_overrides() {
    let dir = tempdir().unwrap();
    let (_db, mut session) = open_session(dir.path());
    session.create_table("t", two_col_schema()).unwrap();

    std::env::set_var("DOLT_COMMITTER_NAME", "Env Committer");
    std::env::set_var("DOLT_COMMITTER_EMAIL", "env@example.com");
    std::env::set_var("DOLT_COMMITTER_DATE", "2024-03-01T12:00:00Z");
    let result = session
        .call_procedure(
            "dolt_commit",
            &["-Am", "env identities", "--author", "Au Thor <au@example.com>"],
        )
        .await;
    std::env::remove_var("DOLT_COMMITTER_NAME");
    std::env::remove_var("DOLT_COMMITTER_EMAIL");
    std::env::remove_var("DOLT_COMMITTER_DATE");

    let hash = result.unwrap().hash().unwrap().to_string();
    let log = system_tables::dolt_log(&session, &[]).unwrap();
    assert_eq!(log[0].commit_hash, hash);
    assert_eq!(log[0].committer, "Env Committer");
    assert_eq!(log[0].email, "env@example.com");
    assert_eq!(
        log[0].date,
        chrono::DateTime::parse_from_rfc3339("2024-03-01T12:00:00Z").unwrap()
    );

    // --author overrode the author only; verify via the raw commit.
    let commit = tributary_core::model::Commit::load(
        &*session.store(),
        &tributary_core::Hash::from_hex(&hash).unwrap(),
    )
    .unwrap();
    assert_eq!(commit.author.name, "Au Thor");
    assert_eq!(commit.author.email, "au@example.com");
}

#[tokio::test]
async fn squash_and_no_ff_merges() {
    let dir = tempdir().unwrap();
    let (_db, mut session) = open_session(dir.path());

    session.create_table("t", two_col_schema()).unwrap();
    call(&mut session, "dolt_commit", &["-Am", "base"]).await;

    session.create_branch("feature", None).unwrap();
    call(&mut session, "dolt_checkout", &["feature"]).await;
    session
        .insert_row("t", vec![Value::Int(1), Value::Int(1)])
        .unwrap();
    call(&mut session, "dolt_commit", &["-am", "feature work"]).await;
    let feature_head = session.head();

    // Fast-forward: main moves to the feature head, no new commit.
    call(&mut session, "dolt_checkout", &["main"]).await;
    let result = call(&mut session, "dolt_merge", &["feature"]).await;
    match result {
        ProcedureResult::Merge {
            hash, fast_forward, ..
        } => {
            assert!(fast_forward);
            assert_eq!(hash, feature_head.to_hex());
        }
        other => panic!("expected merge result, got {other:?}"),
    }
    assert_eq!(session.head(), feature_head);

    // --no-ff from an ancestor still records a two-parent merge commit.
    session.create_branch("feature2", None).unwrap();
    call(&mut session, "dolt_checkout", &["feature2"]).await;
    session
        .insert_row("t", vec![Value::Int(2), Value::Int(2)])
        .unwrap();
    call(&mut session, "dolt_commit", &["-am", "more work"]).await;
    call(&mut session, "dolt_checkout", &["main"]).await;
    let result = call(&mut session, "dolt_merge", &["feature2", "--no-ff"]).await;
    let merge_hash = result.hash().unwrap().to_string();
    let log = system_tables::dolt_log(&session, &[]).unwrap();
    assert_eq!(log[0].commit_hash, merge_hash);
    assert_eq!(log[0].parents.len(), 2);

    // --squash stages the merged content without linking history.
    session.create_branch("feature3", None).unwrap();
    call(&mut session, "dolt_checkout", &["feature3"]).await;
    session
        .insert_row("t", vec![Value::Int(3), Value::Int(3)])
        .unwrap();
    call(&mut session, "dolt_commit", &["-am", "squash me"]).await;
    call(&mut session, "dolt_checkout", &["main"]).await;
    call(&mut session, "dolt_merge", &["feature3", "--squash"]).await;
    let squashed = call(&mut session, "dolt_commit", &["-m", "squashed"]).await;
    let log = system_tables::dolt_log(&session, &[]).unwrap();
    assert_eq!(log[0].commit_hash, squashed.hash().unwrap());
    assert_eq!(log[0].parents.len(), 1);
    assert_eq!(session.scan_table("t").unwrap().len(), 3);
}
