use crate::domain::account::{Account, UserId};
use crate::domain::event::{AccountLogEvent, AccountLogKind, OutboxRecord};
use crate::domain::ledger::{
    BillingCycle, BillingCycleId, EntryFilter, EntryId, LedgerCommit, LedgerEntry, TaskChange,
};
use crate::domain::ports::LedgerStore;
use crate::domain::task::Task;
use crate::domain::user::{NewUser, User, UserUpsert};
use crate::error::{LedgerError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, DB, IteratorMode, Options, WriteBatch};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;

/// Mirrored users keyed by internal id.
pub const CF_USERS: &str = "users";
/// Public id to internal user id.
pub const CF_USER_INDEX: &str = "user_index";
/// Mirrored tasks keyed by public id.
pub const CF_TASKS: &str = "tasks";
pub const CF_ACCOUNTS: &str = "accounts";
/// Ledger entries keyed by big-endian id, so iteration follows id order.
pub const CF_ENTRIES: &str = "entries";
pub const CF_CYCLES: &str = "billing_cycles";
pub const CF_OUTBOX: &str = "outbox";

const ALL_CFS: [&str; 7] = [
    CF_USERS,
    CF_USER_INDEX,
    CF_TASKS,
    CF_ACCOUNTS,
    CF_ENTRIES,
    CF_CYCLES,
    CF_OUTBOX,
];

struct Sequences {
    user: AtomicU64,
    task: AtomicU64,
    entry: AtomicU64,
    cycle: AtomicU64,
    outbox: AtomicU64,
}

/// A persistent ledger store backed by RocksDB.
///
/// Each entity kind lives in its own column family. Multi-key writes go
/// through a `WriteBatch`, which RocksDB applies atomically, and are
/// serialized by `write_lock` so id allocation follows commit order.
///
/// This struct is thread-safe (`Clone` shares the underlying `Arc<DB>`).
#[derive(Clone)]
pub struct RocksDBStore {
    db: Arc<DB>,
    seq: Arc<Sequences>,
    write_lock: Arc<Mutex<()>>,
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| {
        LedgerError::StorageFailure(Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Serialization error: {}", e),
        )))
    })
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|e| {
        LedgerError::StorageFailure(Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Deserialization error: {}", e),
        )))
    })
}

fn key(id: u64) -> [u8; 8] {
    id.to_be_bytes()
}

impl RocksDBStore {
    /// Opens or creates a RocksDB instance at the specified path and restores
    /// id sequences from the highest stored keys.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let descriptors = ALL_CFS
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect::<Vec<_>>();
        let db = DB::open_cf_descriptors(&opts, path, descriptors)?;

        let mut store = Self {
            db: Arc::new(db),
            seq: Arc::new(Sequences {
                user: AtomicU64::new(0),
                task: AtomicU64::new(0),
                entry: AtomicU64::new(0),
                cycle: AtomicU64::new(0),
                outbox: AtomicU64::new(0),
            }),
            write_lock: Arc::new(Mutex::new(())),
        };
        let max_task = store
            .scan::<Task>(CF_TASKS)?
            .iter()
            .map(|t| t.id)
            .max()
            .unwrap_or_default();
        store.seq = Arc::new(Sequences {
            user: AtomicU64::new(store.last_id(CF_USERS)?),
            task: AtomicU64::new(max_task),
            entry: AtomicU64::new(store.last_id(CF_ENTRIES)?),
            cycle: AtomicU64::new(store.last_id(CF_CYCLES)?),
            outbox: AtomicU64::new(store.last_id(CF_OUTBOX)?),
        });
        Ok(store)
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| LedgerError::storage(format!("Column family {name} not found")))
    }

    fn get<T: DeserializeOwned>(&self, cf: &str, key: impl AsRef<[u8]>) -> Result<Option<T>> {
        match self.db.get_cf(self.cf(cf)?, key)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn scan<T: DeserializeOwned>(&self, cf: &str) -> Result<Vec<T>> {
        let mut values = Vec::new();
        for item in self.db.iterator_cf(self.cf(cf)?, IteratorMode::Start) {
            let (_key, value) = item?;
            values.push(decode(&value)?);
        }
        Ok(values)
    }

    fn last_id(&self, cf: &str) -> Result<u64> {
        match self.db.iterator_cf(self.cf(cf)?, IteratorMode::End).next() {
            Some(item) => {
                let (key, _value) = item?;
                let bytes: [u8; 8] = key
                    .as_ref()
                    .try_into()
                    .map_err(|_| LedgerError::storage(format!("Malformed key in {cf}")))?;
                Ok(u64::from_be_bytes(bytes))
            }
            None => Ok(0),
        }
    }

    fn put_outbox(&self, batch: &mut WriteBatch, kind: AccountLogKind, entry: &LedgerEntry) -> Result<()> {
        let id = self.seq.outbox.fetch_add(1, Ordering::SeqCst) + 1;
        let record = OutboxRecord {
            id,
            event: AccountLogEvent::from_entry(kind, entry),
        };
        batch.put_cf(self.cf(CF_OUTBOX)?, key(id), encode(&record)?);
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for RocksDBStore {
    async fn upsert_user(&self, user: NewUser) -> Result<UserUpsert> {
        let _guard = self.write_lock.lock().await;
        let existing = match self.get::<UserId>(CF_USER_INDEX, user.public_id.as_bytes())? {
            Some(id) => self.get::<User>(CF_USERS, key(id))?,
            None => None,
        };

        let upsert = match existing {
            Some(existing) if existing.login == user.login && existing.role == user.role => {
                UserUpsert::Unchanged(existing)
            }
            Some(existing) => UserUpsert::Updated(User {
                login: user.login,
                role: user.role,
                version: existing.version + 1,
                ..existing
            }),
            None => UserUpsert::Created(User {
                id: self.seq.user.fetch_add(1, Ordering::SeqCst) + 1,
                public_id: user.public_id,
                login: user.login,
                role: user.role,
                version: 1,
            }),
        };

        let mirrored = upsert.user();
        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_USERS)?, key(mirrored.id), encode(mirrored)?);
        batch.put_cf(
            self.cf(CF_USER_INDEX)?,
            mirrored.public_id.as_bytes(),
            encode(&mirrored.id)?,
        );
        if self.get::<Account>(CF_ACCOUNTS, key(mirrored.id))?.is_none() {
            batch.put_cf(
                self.cf(CF_ACCOUNTS)?,
                key(mirrored.id),
                encode(&Account::new(mirrored.id))?,
            );
        }
        self.db.write(batch)?;
        Ok(upsert)
    }

    async fn user(&self, user_id: UserId) -> Result<Option<User>> {
        self.get(CF_USERS, key(user_id))
    }

    async fn user_by_public_id(&self, public_id: &str) -> Result<Option<User>> {
        match self.get::<UserId>(CF_USER_INDEX, public_id.as_bytes())? {
            Some(id) => self.get(CF_USERS, key(id)),
            None => Ok(None),
        }
    }

    async fn task_by_public_id(&self, public_id: &str) -> Result<Option<Task>> {
        self.get(CF_TASKS, public_id.as_bytes())
    }

    async fn account(&self, user_id: UserId) -> Result<Option<Account>> {
        self.get(CF_ACCOUNTS, key(user_id))
    }

    async fn accounts(&self) -> Result<Vec<Account>> {
        self.scan(CF_ACCOUNTS)
    }

    async fn commit(&self, commit: LedgerCommit) -> Result<LedgerEntry> {
        let _guard = self.write_lock.lock().await;
        let LedgerCommit { mut entry, task } = commit;

        let task = match task {
            Some(TaskChange::Insert(new_task)) => {
                if self.get::<Task>(CF_TASKS, new_task.public_id.as_bytes())?.is_some() {
                    return Err(LedgerError::ValidationError(format!(
                        "Task {} is already mirrored",
                        new_task.public_id
                    )));
                }
                let task = new_task.into_task(self.seq.task.fetch_add(1, Ordering::SeqCst) + 1);
                entry.task_id = Some(task.id);
                Some(task)
            }
            Some(TaskChange::Update(task)) => {
                if self.get::<Task>(CF_TASKS, task.public_id.as_bytes())?.is_none() {
                    return Err(LedgerError::UnknownTask(task.public_id));
                }
                Some(task)
            }
            None => None,
        };

        let entry = entry.into_entry(self.seq.entry.fetch_add(1, Ordering::SeqCst) + 1);
        let account = Account {
            user_id: entry.user_id,
            balance: entry.resulting_balance,
        };

        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_ENTRIES)?, key(entry.id), encode(&entry)?);
        batch.put_cf(self.cf(CF_ACCOUNTS)?, key(account.user_id), encode(&account)?);
        if let Some(task) = &task {
            batch.put_cf(self.cf(CF_TASKS)?, task.public_id.as_bytes(), encode(task)?);
        }
        self.put_outbox(&mut batch, AccountLogKind::Created, &entry)?;
        self.db.write(batch)?;
        Ok(entry)
    }

    async fn entries(&self, filter: EntryFilter) -> Result<Vec<LedgerEntry>> {
        Ok(self
            .scan::<LedgerEntry>(CF_ENTRIES)?
            .into_iter()
            .filter(|e| filter.matches(e))
            .collect())
    }

    async fn last_entry_id(&self) -> Result<EntryId> {
        Ok(self.seq.entry.load(Ordering::SeqCst))
    }

    async fn create_billing_cycle(&self, closed_at: DateTime<Utc>) -> Result<BillingCycle> {
        let _guard = self.write_lock.lock().await;
        let cycle = BillingCycle {
            id: self.seq.cycle.fetch_add(1, Ordering::SeqCst) + 1,
            closed_at,
        };
        self.db
            .put_cf(self.cf(CF_CYCLES)?, key(cycle.id), encode(&cycle)?)?;
        Ok(cycle)
    }

    async fn billing_cycles_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<BillingCycle>> {
        Ok(self
            .scan::<BillingCycle>(CF_CYCLES)?
            .into_iter()
            .filter(|c| c.closed_at >= from && c.closed_at < to)
            .collect())
    }

    async fn assign_to_cycle(
        &self,
        cycle: BillingCycleId,
        up_to: EntryId,
        extra: &[EntryId],
    ) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        let mut batch = WriteBatch::default();
        let mut retagged = 0;
        for mut entry in self.scan::<LedgerEntry>(CF_ENTRIES)? {
            if entry.is_open() && (entry.id <= up_to || extra.contains(&entry.id)) {
                entry.billing_cycle_id = cycle;
                batch.put_cf(self.cf(CF_ENTRIES)?, key(entry.id), encode(&entry)?);
                self.put_outbox(&mut batch, AccountLogKind::Updated, &entry)?;
                retagged += 1;
            }
        }
        self.db.write(batch)?;
        Ok(retagged)
    }

    async fn pending_outbox(&self, limit: usize) -> Result<Vec<OutboxRecord>> {
        let mut records = Vec::new();
        for item in self
            .db
            .iterator_cf(self.cf(CF_OUTBOX)?, IteratorMode::Start)
            .take(limit)
        {
            let (_key, value) = item?;
            records.push(decode(&value)?);
        }
        Ok(records)
    }

    async fn ack_outbox(&self, ids: &[u64]) -> Result<()> {
        let mut batch = WriteBatch::default();
        for id in ids {
            batch.delete_cf(self.cf(CF_OUTBOX)?, key(*id));
        }
        self.db.write(batch)?;
        Ok(())
    }
}
