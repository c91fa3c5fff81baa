//! Shared test fixtures.

use rusqlite::{Connection, OpenFlags};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::ResourceConfig;
use crate::error::Error;
use crate::resources::{Pool, ResourceKind};

static NEXT_DB: AtomicU64 = AtomicU64::new(0);

/// A connection pool over a uniquely-named shared in-memory database.
pub(crate) fn memory_pool(label: &str) -> Pool<Connection> {
    let unique = NEXT_DB.fetch_add(1, Ordering::SeqCst);
    let uri = format!("file:{}_{}?mode=memory&cache=shared", label, unique);
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_URI;

    // One pinned connection keeps the shared in-memory database alive for
    // the pool's lifetime.
    let anchor = Arc::new(Mutex::new(
        Connection::open_with_flags(&uri, flags).expect("open in-memory database"),
    ));

    Pool::new(
        ResourceKind::RelationalStore,
        &ResourceConfig::default(),
        move || {
            let _keep = Arc::clone(&anchor);
            Connection::open_with_flags(&uri, flags).map_err(Error::from)
        },
    )
}
