//! SQL sessions over the versioned store.
//!
//! A session checks out one branch's working set, reads through Prolly
//! trees over its working root, buffers writes as new working roots, and
//! commits through the chunk-store flush + branch-ref CAS as the single
//! atomic commit point.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tributary_core::cancel::Cancel;
use tributary_core::db::Database;
use tributary_core::hash::Hash;
use tributary_core::merge::{
    self, AcceptAllChecks, ConflictRow, MergeResult,
};
use tributary_core::model::{
    CatalogEntry, ForeignKeyDef, MergeState, ProcedureEntry, RootValue, Schema, Signature, Table,
    WorkingSet,
};
use tributary_core::prolly::ProllyTree;
use tributary_core::refs::RefError;
use tributary_core::remote::{
    self, FetchOptions, FetchStats, PushOptions, PushStats,
};
use tributary_core::store::ChunkStore;
use tributary_core::value::codec::{decode_key, decode_row, encode_key, encode_row, TupleKey};
use tributary_core::value::Value;

use crate::error::SessionError;

pub const COMMITTER_NAME_VAR: &str = "DOLT_COMMITTER_NAME";
pub const COMMITTER_EMAIL_VAR: &str = "DOLT_COMMITTER_EMAIL";
pub const AUTHOR_DATE_VAR: &str = "DOLT_AUTHOR_DATE";
pub const COMMITTER_DATE_VAR: &str = "DOLT_COMMITTER_DATE";

#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// `user.name` for commits.
    pub user_name: String,
    /// `user.email` for commits.
    pub user_email: String,
    pub autocommit: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            user_name: "root".to_string(),
            user_email: "root@localhost".to_string(),
            autocommit: true,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct CommitOpts {
    pub message: Option<String>,
    /// `-a`: stage every working change first.
    pub all: bool,
    /// `-A`: synonym of `-a` on this surface.
    pub all_with_new: bool,
    pub allow_empty: bool,
    pub skip_empty: bool,
    /// `-f`: commit despite unresolved conflicts or violations.
    pub force: bool,
    /// `--author "Name <email>"` override.
    pub author: Option<(String, String)>,
}

#[derive(Clone, Debug, Default)]
pub struct MergeOpts {
    pub message: Option<String>,
    pub no_ff: bool,
    pub squash: bool,
    pub abort: bool,
}

#[derive(Clone, Debug)]
pub struct MergeSummary {
    pub head: Hash,
    pub fast_forward: bool,
    pub conflicts: u64,
    pub violations: u64,
    pub message: String,
}

pub struct Session {
    db: Arc<Database>,
    branch: Option<String>,
    detached: Option<Hash>,
    head: Hash,
    head_root: Hash,
    working: Hash,
    staged: Hash,
    merge_state: Option<MergeState>,
    autocommit: bool,
    in_transaction: bool,
    config: SessionConfig,
}

impl Session {
    /// Open a session on the database's current branch, claiming its
    /// working set.
    pub fn new(db: Arc<Database>, config: SessionConfig) -> Result<Session, SessionError> {
        let branch = db.current_branch();
        db.acquire_branch(&branch)?;
        let mut session = Session {
            db,
            branch: Some(branch),
            detached: None,
            head: Hash::zero(),
            head_root: Hash::zero(),
            working: Hash::zero(),
            staged: Hash::zero(),
            merge_state: None,
            autocommit: config.autocommit,
            in_transaction: false,
            config,
        };
        if let Err(e) = session.load_branch_state() {
            // Claim released by Drop; surface the open failure.
            return Err(e);
        }
        Ok(session)
    }

    fn load_branch_state(&mut self) -> Result<(), SessionError> {
        let branch = self.branch.clone().ok_or(SessionError::DetachedHead)?;
        let (head, commit) = self.db.head_commit(&branch)?;
        let ws = self.db.working_set(&branch)?;
        self.head = head;
        self.head_root = commit.root;
        self.working = ws.working;
        self.staged = ws.staged;
        self.merge_state = ws.merge;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn store(&self) -> Arc<dyn ChunkStore> {
        self.db.store()
    }

    pub fn branch(&self) -> Option<&str> {
        self.branch.as_deref()
    }

    /// The pinned commit when the session is detached from any branch.
    pub fn detached_head(&self) -> Option<Hash> {
        self.detached
    }

    pub fn head(&self) -> Hash {
        self.head
    }

    pub fn head_root(&self) -> Hash {
        self.head_root
    }

    pub fn working_hash(&self) -> Hash {
        self.working
    }

    pub fn staged_hash(&self) -> Hash {
        self.staged
    }

    pub fn merge_state(&self) -> Option<&MergeState> {
        self.merge_state.as_ref()
    }

    pub fn set_autocommit(&mut self, on: bool) {
        self.autocommit = on;
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// The working root, feature-gated: reading a root written by a newer
    /// writer fails with `FeatureTooNew`.
    pub fn working_root(&self) -> Result<RootValue, SessionError> {
        Ok(RootValue::load(
            &*self.store(),
            &self.working,
            self.db.feature_version(),
        )?)
    }

    pub(crate) fn staged_root(&self) -> Result<RootValue, SessionError> {
        Ok(RootValue::load(
            &*self.store(),
            &self.staged,
            self.db.feature_version(),
        )?)
    }

    fn working_set_snapshot(&self) -> WorkingSet {
        WorkingSet {
            working: self.working,
            staged: self.staged,
            merge: self.merge_state.clone(),
        }
    }

    fn persist_working_set(&self) -> Result<(), SessionError> {
        if let Some(branch) = &self.branch {
            self.db
                .update_working_set(branch, &self.working_set_snapshot())?;
        }
        Ok(())
    }

    /// Store a new working root and, under autocommit, advance the
    /// working-set ref.
    fn persist_root(&mut self, root: &RootValue) -> Result<(), SessionError> {
        self.working = root.store(&*self.store())?;
        self.statement_end()
    }

    fn statement_end(&mut self) -> Result<(), SessionError> {
        if self.autocommit && !self.in_transaction {
            self.persist_working_set()?;
        }
        Ok(())
    }

    /// Statement hook for autocommit mode: re-stamps the working root
    /// with this writer's feature version (so even a bare SELECT rewrites
    /// a working-set root) and advances the working-set ref.
    pub fn touch_working_set(&mut self) -> Result<(), SessionError> {
        if !self.autocommit || self.in_transaction {
            return Ok(());
        }
        let mut root = self.working_root()?;
        if root.feature_version != self.db.feature_version() {
            root.feature_version = self.db.feature_version();
            self.working = root.store(&*self.store())?;
        }
        self.persist_working_set()
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    pub fn begin(&mut self) {
        self.in_transaction = true;
    }

    /// Commit the SQL transaction: publish the session's working set.
    pub fn commit_transaction(&mut self) -> Result<(), SessionError> {
        self.in_transaction = false;
        self.persist_working_set()
    }

    /// Roll back: discard in-memory state and reload from the refs.
    pub fn rollback(&mut self) -> Result<(), SessionError> {
        self.in_transaction = false;
        self.load_branch_state()
    }

    // ------------------------------------------------------------------
    // DDL
    // ------------------------------------------------------------------

    pub fn create_table(&mut self, name: &str, schema: Schema) -> Result<(), SessionError> {
        self.require_writable()?;
        let mut root = self.working_root()?;
        if root.has_table(name) {
            return Err(SessionError::TableExists(name.to_string()));
        }
        let table = Table::create(&*self.store(), &schema)?;
        root.put_table(&*self.store(), name, &table)?;
        self.persist_root(&root)
    }

    pub fn drop_table(&mut self, name: &str) -> Result<(), SessionError> {
        self.require_writable()?;
        let mut root = self.working_root()?;
        if !root.remove_table(name) {
            return Err(SessionError::UnknownTable(name.to_string()));
        }
        root.foreign_keys.retain(|fk| fk.table != name);
        self.persist_root(&root)
    }

    pub fn set_auto_increment(&mut self, name: &str, next: u64) -> Result<(), SessionError> {
        self.require_writable()?;
        let mut root = self.working_root()?;
        let mut table = self.table_of(&root, name)?;
        table.auto_increment = Some(next);
        root.put_table(&*self.store(), name, &table)?;
        self.persist_root(&root)
    }

    pub fn add_foreign_key(&mut self, fk: ForeignKeyDef) -> Result<(), SessionError> {
        self.require_writable()?;
        let mut root = self.working_root()?;
        if !root.has_table(&fk.table) {
            return Err(SessionError::UnknownTable(fk.table));
        }
        if !root.has_table(&fk.parent_table) {
            return Err(SessionError::UnknownTable(fk.parent_table));
        }
        root.foreign_keys.push(fk);
        self.persist_root(&root)
    }

    pub fn put_catalog_entry(&mut self, entry: CatalogEntry) -> Result<(), SessionError> {
        self.require_writable()?;
        let mut root = self.working_root()?;
        root.schemas.insert(entry.name.clone(), entry);
        self.persist_root(&root)
    }

    pub fn put_procedure_entry(&mut self, entry: ProcedureEntry) -> Result<(), SessionError> {
        self.require_writable()?;
        let mut root = self.working_root()?;
        root.procedures.insert(entry.name.clone(), entry);
        self.persist_root(&root)
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    fn table_of(&self, root: &RootValue, name: &str) -> Result<Table, SessionError> {
        root.table(&*self.store(), name)?
            .ok_or_else(|| SessionError::UnknownTable(name.to_string()))
    }

    pub fn table_names(&self) -> Result<Vec<String>, SessionError> {
        Ok(self.working_root()?.table_names())
    }

    pub fn table_schema(&self, name: &str) -> Result<Schema, SessionError> {
        let root = self.working_root()?;
        let table = self.table_of(&root, name)?;
        Ok(table.load_schema(&*self.store())?)
    }

    /// Full-table scan in primary-key order, returning full rows.
    pub fn scan_table(&self, name: &str) -> Result<Vec<Vec<Value>>, SessionError> {
        let root = self.working_root()?;
        let table = self.table_of(&root, name)?;
        let schema = table.load_schema(&*self.store())?;
        rows_in_tree(&self.store(), &schema, table.primary)
    }

    pub fn get_row(&self, name: &str, pk: &[Value]) -> Result<Option<Vec<Value>>, SessionError> {
        let root = self.working_root()?;
        let table = self.table_of(&root, name)?;
        let schema = table.load_schema(&*self.store())?;
        let key = encode_key(schema.schema_id(), pk)?;
        let tree = ProllyTree::new(self.store(), table.primary);
        match tree.get(&key)? {
            Some(value_bytes) => {
                let (_, values) = decode_row(&*self.store(), &value_bytes)?;
                Ok(Some(schema.join_row(pk, &values)))
            }
            None => Ok(None),
        }
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    fn require_writable(&self) -> Result<(), SessionError> {
        if self.branch.is_none() {
            return Err(SessionError::DetachedHead);
        }
        Ok(())
    }

    fn validate_row(&self, schema: &Schema, row: &[Value]) -> Result<(), SessionError> {
        if row.len() != schema.columns.len() {
            return Err(SessionError::ArityMismatch);
        }
        for (value, col) in row.iter().zip(&schema.columns) {
            if value.is_null() {
                if !col.nullable {
                    return Err(SessionError::NullViolation(col.name.clone()));
                }
                continue;
            }
            if !value.fits(col.ty) {
                return Err(SessionError::BadColumnValue(col.name.clone()));
            }
        }
        Ok(())
    }

    /// Find an entry in a unique index sharing `indexed` values (any pk).
    fn unique_clash(
        &self,
        index_root: Option<Hash>,
        schema_id: u32,
        indexed: &[Value],
        exclude_pk: Option<&[Value]>,
        pk_len: usize,
    ) -> Result<bool, SessionError> {
        if indexed.iter().any(Value::is_null) {
            return Ok(false);
        }
        let prefix = encode_key(schema_id, indexed)?;
        let tree = ProllyTree::new(self.store(), index_root);
        for (key_bytes, _) in tree.scan(Some(&prefix), None)? {
            let (_, covering) = decode_key(&key_bytes)?;
            if covering.len() < pk_len || covering.len() - pk_len != indexed.len() {
                break;
            }
            let (head, tail) = covering.split_at(indexed.len());
            if head != indexed {
                break;
            }
            if exclude_pk.map_or(true, |pk| tail != pk) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Apply one row change to the primary and every secondary index.
    fn write_row(
        &mut self,
        root: &mut RootValue,
        name: &str,
        old_row: Option<&[Value]>,
        new_row: Option<&[Value]>,
    ) -> Result<(), SessionError> {
        let mut table = self.table_of(root, name)?;
        let schema = table.load_schema(&*self.store())?;
        let schema_id = schema.schema_id();
        let store = self.store();

        let mut primary_edits: BTreeMap<TupleKey, Option<Vec<u8>>> = BTreeMap::new();
        let mut index_edits: Vec<BTreeMap<TupleKey, Option<Vec<u8>>>> =
            schema.indexes.iter().map(|_| BTreeMap::new()).collect();

        if let Some(old) = old_row {
            let (pk, _) = schema.split_row(old);
            primary_edits.insert(TupleKey(encode_key(schema_id, &pk)?), None);
            for (slot, index) in schema.indexes.iter().enumerate() {
                let covering =
                    tributary_core::model::table::covering_key(&schema, &index.tags, old, &pk);
                index_edits[slot].insert(TupleKey(encode_key(schema_id, &covering)?), None);
            }
        }
        if let Some(new) = new_row {
            let (pk, values) = schema.split_row(new);
            let key = encode_key(schema_id, &pk)?;
            let value = encode_row(&*store, schema_id, &values)?;
            primary_edits.insert(TupleKey(key), Some(value));
            for (slot, index) in schema.indexes.iter().enumerate() {
                let covering =
                    tributary_core::model::table::covering_key(&schema, &index.tags, new, &pk);
                index_edits[slot]
                    .insert(TupleKey(encode_key(schema_id, &covering)?), Some(Vec::new()));
            }
            // Advance the auto-increment counter past inserted keys.
            if let (Some(next), Some(Value::Int(v))) = (table.auto_increment, pk.first()) {
                if *v >= 0 && (*v as u64) >= next {
                    table.auto_increment = Some(*v as u64 + 1);
                }
            }
        }

        let primary = ProllyTree::new(store.clone(), table.primary).apply_edits(&primary_edits)?;
        table.primary = primary.root_hash();
        let mut secondary = Vec::with_capacity(schema.indexes.len());
        for ((index, edits), (_, old_root)) in schema
            .indexes
            .iter()
            .zip(index_edits)
            .zip(table.secondary.iter())
        {
            let tree = ProllyTree::new(store.clone(), *old_root).apply_edits(&edits)?;
            secondary.push((index.name.clone(), tree.root_hash()));
        }
        table.secondary = secondary;
        root.put_table(&*store, name, &table)?;
        Ok(())
    }

    pub fn insert_row(&mut self, name: &str, row: Vec<Value>) -> Result<(), SessionError> {
        let skipped = self.insert_rows(name, vec![row], false)?;
        debug_assert_eq!(skipped, 0);
        Ok(())
    }

    /// Insert rows. With `ignore`, offending rows are skipped and
    /// counted instead of failing the statement; without it, the first
    /// offending row fails the statement and the working root is left
    /// unchanged.
    pub fn insert_rows(
        &mut self,
        name: &str,
        rows: Vec<Vec<Value>>,
        ignore: bool,
    ) -> Result<u64, SessionError> {
        self.require_writable()?;
        let mut root = self.working_root()?;
        let mut skipped = 0u64;

        for mut row in rows {
            let table = self.table_of(&root, name)?;
            let schema = table.load_schema(&*self.store())?;
            let schema_id = schema.schema_id();

            // Fill a NULL leading integer key from the counter.
            if let (Some(next), Some(pos)) = (table.auto_increment, schema.pk_positions().first().copied())
            {
                if row.get(pos).is_some_and(Value::is_null) {
                    row[pos] = Value::Int(next as i64);
                }
            }

            let outcome: Result<(), SessionError> = (|| {
                self.validate_row(&schema, &row)?;
                let (pk, _) = schema.split_row(&row);
                let key = encode_key(schema_id, &pk)?;
                let primary = ProllyTree::new(self.store(), table.primary);
                if primary.get(&key)?.is_some() {
                    return Err(SessionError::DuplicateKey(name.to_string()));
                }
                for index in schema.indexes.iter().filter(|idx| idx.unique) {
                    let indexed: Vec<Value> = index
                        .tags
                        .iter()
                        .filter_map(|tag| schema.column_by_tag(*tag).map(|(i, _)| row[i].clone()))
                        .collect();
                    let index_root = table
                        .secondary
                        .iter()
                        .find(|(n, _)| *n == index.name)
                        .and_then(|(_, r)| *r);
                    if self.unique_clash(index_root, schema_id, &indexed, None, pk.len())? {
                        return Err(SessionError::DuplicateUnique(index.name.clone()));
                    }
                }
                Ok(())
            })();

            match outcome {
                Ok(()) => self.write_row(&mut root, name, None, Some(&row))?,
                Err(e) if ignore && e.is_user_error() => {
                    skipped += 1;
                    tracing::debug!(table = name, error = %e, "skipped row");
                }
                Err(e) => return Err(e),
            }
        }

        self.persist_root(&root)?;
        Ok(skipped)
    }

    /// Replace the row with the same primary key.
    pub fn update_row(&mut self, name: &str, row: Vec<Value>) -> Result<(), SessionError> {
        self.require_writable()?;
        let mut root = self.working_root()?;
        let table = self.table_of(&root, name)?;
        let schema = table.load_schema(&*self.store())?;
        self.validate_row(&schema, &row)?;

        let (pk, _) = schema.split_row(&row);
        let old = self
            .get_row(name, &pk)?
            .ok_or_else(|| SessionError::RowNotFound(name.to_string()))?;

        for index in schema.indexes.iter().filter(|idx| idx.unique) {
            let indexed: Vec<Value> = index
                .tags
                .iter()
                .filter_map(|tag| schema.column_by_tag(*tag).map(|(i, _)| row[i].clone()))
                .collect();
            let index_root = table
                .secondary
                .iter()
                .find(|(n, _)| *n == index.name)
                .and_then(|(_, r)| *r);
            if self.unique_clash(
                index_root,
                schema.schema_id(),
                &indexed,
                Some(&pk),
                pk.len(),
            )? {
                return Err(SessionError::DuplicateUnique(index.name.clone()));
            }
        }

        self.write_row(&mut root, name, Some(&old), Some(&row))?;
        self.persist_root(&root)
    }

    /// Delete by primary key; returns whether a row existed.
    pub fn delete_row(&mut self, name: &str, pk: &[Value]) -> Result<bool, SessionError> {
        self.require_writable()?;
        let mut root = self.working_root()?;
        match self.get_row(name, pk)? {
            Some(old) => {
                self.write_row(&mut root, name, Some(&old), None)?;
                self.persist_root(&root)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // ------------------------------------------------------------------
    // Staging and commit
    // ------------------------------------------------------------------

    /// `dolt_add -A`: stage everything.
    pub fn add_all(&mut self) -> Result<(), SessionError> {
        self.require_writable()?;
        self.staged = self.working;
        self.statement_end()
    }

    /// `dolt_add t1 t2 ...`: stage the named tables only.
    pub fn add_tables(&mut self, names: &[String]) -> Result<(), SessionError> {
        self.require_writable()?;
        let working = self.working_root()?;
        let mut staged = self.staged_root()?;
        for name in names {
            match working.tables.get(name) {
                Some(hash) => {
                    staged.tables.insert(name.clone(), *hash);
                }
                None => {
                    if !staged.remove_table(name) {
                        return Err(SessionError::UnknownTable(name.clone()));
                    }
                }
            }
        }
        self.staged = staged.store(&*self.store())?;
        self.statement_end()
    }

    /// Tables whose working state differs from HEAD.
    pub fn dirty_tables(&self) -> Result<Vec<String>, SessionError> {
        let head = RootValue::load(&*self.store(), &self.head_root, self.db.feature_version())?;
        let working = self.working_root()?;
        Ok(changed_tables(&head, &working))
    }

    fn signatures(&self, opts: &CommitOpts) -> Result<(Signature, Signature), SessionError> {
        let committer_name =
            std::env::var(COMMITTER_NAME_VAR).unwrap_or_else(|_| self.config.user_name.clone());
        let committer_email =
            std::env::var(COMMITTER_EMAIL_VAR).unwrap_or_else(|_| self.config.user_email.clone());
        let committer_date = date_from_env(COMMITTER_DATE_VAR).unwrap_or_else(Utc::now);
        let author_date = date_from_env(AUTHOR_DATE_VAR).unwrap_or(committer_date);

        let committer = Signature::new(&committer_name, &committer_email, committer_date);
        let author = match &opts.author {
            Some((name, email)) => Signature::new(name, email, author_date),
            None => Signature::new(&committer_name, &committer_email, author_date),
        };
        Ok((author, committer))
    }

    /// The `dolt_commit` protocol. Returns `None` when `--skip-empty`
    /// found nothing staged.
    pub fn commit(&mut self, opts: CommitOpts) -> Result<Option<Hash>, SessionError> {
        self.require_writable()?;
        let branch = self.branch.clone().expect("writable implies branch");

        if opts.allow_empty && opts.skip_empty {
            return Err(SessionError::AllowSkipEmpty);
        }
        let message = opts
            .message
            .clone()
            .ok_or(SessionError::MissingMessage)?;

        // Step 1: stage. Both -a and -A stage every working change,
        // new tables included.
        if opts.all || opts.all_with_new {
            self.staged = self.working;
        }

        // Step 2: validate. Conflicts anywhere in the working set block
        // the commit until resolved (or forced).
        if !opts.force {
            for root in [self.staged_root()?, self.working_root()?] {
                for name in root.table_names() {
                    let table = self.table_of(&root, &name)?;
                    if table.has_conflicts() || table.has_violations() {
                        return Err(SessionError::UnresolvedConflicts(name));
                    }
                }
            }
        }
        if self.staged == self.head_root {
            if opts.skip_empty {
                return Ok(None);
            }
            if !opts.allow_empty {
                return Err(SessionError::NothingToCommit);
            }
        }

        // Steps 3-4: flush chunks, build the commit, CAS the branch ref.
        let (author, committer) = self.signatures(&opts)?;
        let extra_parent = self.merge_state.as_ref().map(|m| m.source);
        let result = self.db.create_commit(
            &branch,
            self.head,
            self.staged,
            extra_parent,
            author,
            committer,
            &message,
        );
        let new_head = match result {
            Ok(hash) => hash,
            Err(tributary_core::db::DbError::Ref(RefError::Stale { .. })) => {
                // Another session advanced the branch: roll back our
                // in-memory state without exposing partial data.
                self.load_branch_state()?;
                return Err(SessionError::TransactionConflict);
            }
            Err(e) => return Err(e.into()),
        };

        // Step 5: working set follows the new head; staged is clean.
        self.head = new_head;
        self.head_root = self.staged;
        self.merge_state = None;
        self.persist_working_set()?;
        Ok(Some(new_head))
    }

    // ------------------------------------------------------------------
    // Merge
    // ------------------------------------------------------------------

    pub fn merge(&mut self, source: &str, opts: MergeOpts) -> Result<MergeSummary, SessionError> {
        self.require_writable()?;
        if opts.abort {
            return self.merge_abort();
        }
        if self.merge_state.is_some() {
            return Err(SessionError::AlreadyMerging);
        }

        let theirs = self.db.resolve_revision(source)?;
        let store = self.store();
        let pre_working = self.working;
        let dirty = self.dirty_tables()?;

        let result = merge::merge_commits(
            &store,
            self.db.feature_version(),
            &self.head,
            &theirs,
            &Cancel::new(),
            &AcceptAllChecks,
        )?;

        match result {
            MergeResult::AlreadyUpToDate => Ok(MergeSummary {
                head: self.head,
                fast_forward: false,
                conflicts: 0,
                violations: 0,
                message: "Already up to date.".to_string(),
            }),
            MergeResult::FastForward { head, root } => {
                if opts.squash {
                    self.guard_dirty_overlap(&root, &dirty)?;
                    self.apply_merge_root(&root, pre_working)?;
                    self.staged = root;
                    self.persist_working_set()?;
                    return Ok(MergeSummary {
                        head: self.head,
                        fast_forward: false,
                        conflicts: 0,
                        violations: 0,
                        message: format!("Squash merged {source}; commit to record."),
                    });
                }
                if opts.no_ff {
                    return self.finish_merge_commit(source, &opts, theirs, root, &dirty, 0, 0);
                }
                // Plain pointer move.
                self.guard_dirty_overlap(&root, &dirty)?;
                self.db
                    .refs()
                    .update(&tributary_core::refs::RefName::branch(
                        self.branch.as_deref().expect("writable"),
                    ), self.head, head)
                    .map_err(|e| match e {
                        RefError::Stale { .. } => SessionError::TransactionConflict,
                        other => SessionError::Ref(other),
                    })?;
                let old_head_root = self.head_root;
                self.head = head;
                self.head_root = root;
                self.staged = root;
                self.working = overlay_tables(&store, &old_head_root, pre_working, &root)?;
                self.persist_working_set()?;
                Ok(MergeSummary {
                    head,
                    fast_forward: true,
                    conflicts: 0,
                    violations: 0,
                    message: "Fast-forward".to_string(),
                })
            }
            MergeResult::Merged { outcome, .. } => {
                if outcome.conflicts > 0 || outcome.violations > 0 {
                    self.guard_dirty_overlap(&outcome.root, &dirty)?;
                    self.apply_merge_root(&outcome.root, pre_working)?;
                    self.merge_state = Some(MergeState {
                        source: theirs,
                        pre_working,
                    });
                    self.persist_working_set()?;
                    return Ok(MergeSummary {
                        head: self.head,
                        fast_forward: false,
                        conflicts: outcome.conflicts,
                        violations: outcome.violations,
                        message: "Automatic merge failed; fix conflicts and then commit the result."
                            .to_string(),
                    });
                }
                if opts.squash {
                    self.guard_dirty_overlap(&outcome.root, &dirty)?;
                    self.apply_merge_root(&outcome.root, pre_working)?;
                    self.staged = outcome.root;
                    self.persist_working_set()?;
                    return Ok(MergeSummary {
                        head: self.head,
                        fast_forward: false,
                        conflicts: 0,
                        violations: 0,
                        message: format!("Squash merged {source}; commit to record."),
                    });
                }
                self.finish_merge_commit(source, &opts, theirs, outcome.root, &dirty, 0, 0)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn finish_merge_commit(
        &mut self,
        source: &str,
        opts: &MergeOpts,
        theirs: Hash,
        merged_root: Hash,
        dirty: &[String],
        conflicts: u64,
        violations: u64,
    ) -> Result<MergeSummary, SessionError> {
        self.guard_dirty_overlap(&merged_root, dirty)?;
        let branch = self.branch.clone().expect("writable");
        let message = opts
            .message
            .clone()
            .unwrap_or_else(|| format!("Merge branch '{source}' into {branch}"));
        let commit_opts = CommitOpts {
            message: Some(message.clone()),
            ..Default::default()
        };
        let (author, committer) = self.signatures(&commit_opts)?;
        let result = self.db.create_commit(
            &branch,
            self.head,
            merged_root,
            Some(theirs),
            author,
            committer,
            &message,
        );
        let new_head = match result {
            Ok(hash) => hash,
            Err(tributary_core::db::DbError::Ref(RefError::Stale { .. })) => {
                self.load_branch_state()?;
                return Err(SessionError::TransactionConflict);
            }
            Err(e) => return Err(e.into()),
        };

        let store = self.store();
        let old_head_root = self.head_root;
        let pre_working = self.working;
        self.head = new_head;
        self.head_root = merged_root;
        self.staged = merged_root;
        self.working = overlay_tables(&store, &old_head_root, pre_working, &merged_root)?;
        self.merge_state = None;
        self.persist_working_set()?;
        Ok(MergeSummary {
            head: new_head,
            fast_forward: false,
            conflicts,
            violations,
            message,
        })
    }

    /// Merge result lands in the working root, with the session's dirty
    /// unrelated tables carried over.
    fn apply_merge_root(
        &mut self,
        merged_root: &Hash,
        pre_working: Hash,
    ) -> Result<(), SessionError> {
        let store = self.store();
        self.working = overlay_tables(&store, &self.head_root, pre_working, merged_root)?;
        Ok(())
    }

    fn guard_dirty_overlap(
        &self,
        merged_root: &Hash,
        dirty: &[String],
    ) -> Result<(), SessionError> {
        if dirty.is_empty() {
            return Ok(());
        }
        let store = self.store();
        let fv = self.db.feature_version();
        let head = RootValue::load(&*store, &self.head_root, fv)?;
        let merged = RootValue::load(&*store, merged_root, fv)?;
        let merge_touched = changed_tables(&head, &merged);
        for table in dirty {
            if merge_touched.contains(table) {
                return Err(SessionError::WouldOverwrite(table.clone()));
            }
        }
        Ok(())
    }

    fn merge_abort(&mut self) -> Result<MergeSummary, SessionError> {
        let state = self.merge_state.take().ok_or(SessionError::NotMerging)?;
        // Restore the pre-merge working root wholesale: merge-touched
        // tables reset, unrelated dirty edits survive.
        self.working = state.pre_working;
        self.staged = self.head_root;
        self.persist_working_set()?;
        Ok(MergeSummary {
            head: self.head,
            fast_forward: false,
            conflicts: 0,
            violations: 0,
            message: "Merge aborted.".to_string(),
        })
    }

    /// `dolt_conflicts_resolve`: keep ours (drop the artifacts) or take
    /// theirs (apply their rows, then drop the artifacts).
    pub fn resolve_conflicts(
        &mut self,
        tables: &[String],
        theirs: bool,
    ) -> Result<(), SessionError> {
        self.require_writable()?;
        let mut root = self.working_root()?;
        let store = self.store();

        let names: Vec<String> = if tables.is_empty() {
            root.table_names()
        } else {
            tables.to_vec()
        };

        for name in &names {
            let mut table = self.table_of(&root, name)?;
            let Some(conflicts) = table.conflicts.clone() else {
                if !tables.is_empty() {
                    return Err(SessionError::Usage(format!(
                        "table '{name}' has no conflicts"
                    )));
                }
                continue;
            };
            let schema = table.load_schema(&*store)?;
            let schema_id = schema.schema_id();

            if theirs {
                let tree = ProllyTree::new(store.clone(), Some(conflicts.tree));
                let mut edits: BTreeMap<TupleKey, Option<Vec<u8>>> = BTreeMap::new();
                let mut cursor = tree.cursor()?;
                while let Some((_, conflict_bytes)) = cursor.peek_cloned() {
                    cursor.advance()?;
                    let conflict = ConflictRow::from_bytes(&conflict_bytes)?;
                    match conflict.theirs {
                        Some(row) => {
                            let (pk, values) = schema.split_row(&row);
                            let key = encode_key(schema_id, &pk)?;
                            let value = encode_row(&*store, schema_id, &values)?;
                            edits.insert(TupleKey(key), Some(value));
                        }
                        None => {
                            let row = conflict
                                .ours
                                .or(conflict.base)
                                .expect("conflict has at least one side");
                            let (pk, _) = schema.split_row(&row);
                            edits.insert(TupleKey(encode_key(schema_id, &pk)?), None);
                        }
                    }
                }
                let primary =
                    ProllyTree::new(store.clone(), table.primary).apply_edits(&edits)?;
                table.primary = primary.root_hash();
                table.rebuild_secondary_indexes(store.clone(), &schema)?;
            }
            table.conflicts = None;
            root.put_table(&*store, name, &table)?;
        }
        self.persist_root(&root)
    }

    // ------------------------------------------------------------------
    // Checkout and branches
    // ------------------------------------------------------------------

    pub fn checkout_branch(&mut self, name: &str) -> Result<(), SessionError> {
        if self.branch.as_deref() == Some(name) {
            return Ok(());
        }
        // Publish current state before leaving the branch.
        self.persist_working_set()?;
        self.db.acquire_branch(name)?;
        if let Some(old) = self.branch.take() {
            self.db.release_branch(&old);
        }
        self.branch = Some(name.to_string());
        self.detached = None;
        if let Err(e) = self.load_branch_state() {
            return Err(e);
        }
        self.db.set_current_branch(name)?;
        Ok(())
    }

    /// `dolt_checkout -b`: create a branch (at `start` or HEAD) and
    /// switch to it.
    pub fn checkout_new_branch(
        &mut self,
        name: &str,
        start: Option<&str>,
    ) -> Result<(), SessionError> {
        let at = match start {
            Some(spec) => self.db.resolve_revision(spec)?,
            None => self.head,
        };
        self.db.create_branch(name, at)?;
        self.checkout_branch(name)
    }

    /// Detach onto a commit: read-only until a branch is checked out.
    pub fn checkout_commit(&mut self, spec: &str) -> Result<(), SessionError> {
        let commit_hash = self.db.resolve_revision(spec)?;
        self.persist_working_set()?;
        if let Some(old) = self.branch.take() {
            self.db.release_branch(&old);
        }
        let commit =
            tributary_core::model::Commit::load(&*self.store(), &commit_hash)?;
        self.detached = Some(commit_hash);
        self.head = commit_hash;
        self.head_root = commit.root;
        self.working = commit.root;
        self.staged = commit.root;
        self.merge_state = None;
        Ok(())
    }

    pub fn create_branch(&mut self, name: &str, start: Option<&str>) -> Result<(), SessionError> {
        let at = match start {
            Some(spec) => self.db.resolve_revision(spec)?,
            None => self.head,
        };
        Ok(self.db.create_branch(name, at)?)
    }

    pub fn delete_branch(&mut self, name: &str) -> Result<(), SessionError> {
        Ok(self.db.delete_branch(name)?)
    }

    // ------------------------------------------------------------------
    // Remote sync
    // ------------------------------------------------------------------

    pub async fn fetch(
        &mut self,
        remote_name: &str,
        refspecs: &[String],
        force: bool,
        prune: bool,
    ) -> Result<FetchStats, SessionError> {
        let remote = self.db.remote(remote_name)?;
        let transport = remote.transport()?;
        let store = self.store();
        let stats = remote::fetch(
            &store,
            self.db.refs(),
            self.db.feature_version(),
            &remote,
            &*transport,
            refspecs,
            FetchOptions { force, prune },
            &Cancel::new(),
        )
        .await?;
        Ok(stats)
    }

    pub async fn push(
        &mut self,
        remote_name: &str,
        branch: Option<&str>,
        force: bool,
    ) -> Result<PushStats, SessionError> {
        let remote = self.db.remote(remote_name)?;
        let transport = remote.transport()?;
        let store = self.store();
        let branch = branch
            .map(str::to_string)
            .or_else(|| self.branch.clone())
            .ok_or(SessionError::DetachedHead)?;
        let stats = remote::push(
            &store,
            self.db.refs(),
            &remote,
            &*transport,
            &branch,
            PushOptions { force },
            &Cancel::new(),
        )
        .await?;
        Ok(stats)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(branch) = &self.branch {
            self.db.release_branch(branch);
        }
    }
}

fn date_from_env(var: &str) -> Option<DateTime<Utc>> {
    let raw = std::env::var(var).ok()?;
    if let Ok(parsed) = DateTime::parse_from_rfc3339(&raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    chrono::NaiveDateTime::parse_from_str(&raw, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Tables whose hash differs between two roots (added, dropped, or
/// modified).
pub(crate) fn changed_tables(a: &RootValue, b: &RootValue) -> Vec<String> {
    let mut names: Vec<String> = a.table_names();
    for name in b.table_names() {
        if !names.contains(&name) {
            names.push(name);
        }
    }
    names
        .into_iter()
        .filter(|name| a.tables.get(name) != b.tables.get(name))
        .collect()
}

/// Carry dirty tables from `working` (relative to `old_base`) onto
/// `onto`, returning the hash of the combined root.
fn overlay_tables(
    store: &Arc<dyn ChunkStore>,
    old_base: &Hash,
    working: Hash,
    onto: &Hash,
) -> Result<Hash, SessionError> {
    if working == *old_base {
        return Ok(*onto);
    }
    let fv = u32::MAX; // internal roots already gated at session entry
    let base_root = RootValue::load(&**store, old_base, fv)?;
    let working_root = RootValue::load(&**store, &working, fv)?;
    let mut onto_root = RootValue::load(&**store, onto, fv)?;

    for name in changed_tables(&base_root, &working_root) {
        match working_root.tables.get(&name) {
            Some(hash) => {
                onto_root.tables.insert(name.clone(), *hash);
            }
            None => {
                onto_root.remove_table(&name);
            }
        }
    }
    Ok(onto_root.store(&**store)?)
}

/// Decode every row of a table tree into full rows, verifying each tuple
/// was encoded under `schema`.
pub(crate) fn rows_in_tree(
    store: &Arc<dyn ChunkStore>,
    schema: &Schema,
    root: Option<Hash>,
) -> Result<Vec<Vec<Value>>, SessionError> {
    let expected = schema.schema_id();
    let tree = ProllyTree::new(store.clone(), root);
    let mut rows = Vec::new();
    let mut cursor = tree.cursor()?;
    while let Some((key_bytes, value_bytes)) = cursor.peek_cloned() {
        cursor.advance()?;
        let (key_id, pk) = decode_key(&key_bytes)?;
        if key_id != expected {
            return Err(tributary_core::value::ValueError::SchemaMismatch {
                expected,
                found: key_id,
            }
            .into());
        }
        let (_, values) = decode_row(&**store, &value_bytes)?;
        rows.push(schema.join_row(&pk, &values));
    }
    Ok(rows)
}
