//! File-system facade: the session object tying the MFT, the allocation
//! bitmap and the security descriptor index together.
//!
//! One facade is opened per volume session and may be queried from many
//! threads. Lookups take a reader lease on the facade; the MFT cache keeps
//! its own fine-grained lock so block I/O never happens under the facade
//! lock. The volume itself is treated as immutable for the session's
//! duration.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::bitmap::{self, ClusterRange};
use crate::cancel::CancelToken;
use crate::entry::MftEntry;
use crate::error::{FsError, Result};
use crate::io::{VolumeGeometry, VolumeRead};
use crate::mft::{Mft, MftReadFlags};
use crate::security::{SecurityDescriptor, SecurityIndex};

/// Default bound on the number of cached MFT entries.
pub const DEFAULT_CACHE_CAPACITY: usize = 128;

/// Session configuration.
#[derive(Debug, Clone)]
pub struct FileSystemOptions {
    /// Bound on the number of cached MFT entries.
    pub cache_capacity: usize,
    /// Cancellation token observed by long scans.
    pub cancel: CancelToken,
}

impl Default for FileSystemOptions {
    fn default() -> Self {
        Self {
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            cancel: CancelToken::new(),
        }
    }
}

#[derive(Default)]
struct State {
    mft: Option<Arc<Mft>>,
    security: Option<Arc<SecurityIndex>>,
    security_loaded: bool,
}

/// A read-only NTFS metadata session.
pub struct FileSystem {
    geometry: VolumeGeometry,
    options: FileSystemOptions,
    state: RwLock<State>,
}

impl FileSystem {
    /// Creates a facade with no MFT and no security index; `read_mft` must
    /// run before entries can be served.
    pub fn new(geometry: VolumeGeometry) -> Self {
        Self::with_options(geometry, FileSystemOptions::default())
    }

    pub fn with_options(geometry: VolumeGeometry, options: FileSystemOptions) -> Self {
        Self {
            geometry,
            options,
            state: RwLock::new(State::default()),
        }
    }

    pub fn geometry(&self) -> &VolumeGeometry {
        &self.geometry
    }

    /// Reads the MFT, performing the entry-0 bootstrap. Fails with
    /// `AlreadyInitialized` on a second call; on failure no partial state
    /// is kept and the call may be retried.
    pub fn read_mft(
        &self,
        io: &dyn VolumeRead,
        mft_offset: u64,
        mft_size: u64,
        flags: MftReadFlags,
    ) -> Result<()> {
        if self.state.read().mft.is_some() {
            return Err(FsError::AlreadyInitialized);
        }
        // The bootstrap runs without any facade lock held; only the commit
        // takes the writer lease.
        let mft = Mft::bootstrap(
            &self.geometry,
            io,
            mft_offset,
            mft_size,
            flags,
            self.options.cache_capacity,
            self.options.cancel.clone(),
        )?;

        let mut state = self.state.write();
        if state.mft.is_some() {
            return Err(FsError::AlreadyInitialized);
        }
        debug!(entries = mft.number_of_entries(), "MFT attached to session");
        state.mft = Some(Arc::new(mft));
        Ok(())
    }

    /// Number of MFT entries as recorded at bootstrap; zero before
    /// `read_mft` succeeds.
    pub fn number_of_mft_entries(&self) -> u64 {
        self.state
            .read()
            .mft
            .as_ref()
            .map_or(0, |mft| mft.number_of_entries())
    }

    /// Returns a shared handle to a cached entry.
    pub fn mft_entry_by_index(&self, io: &dyn VolumeRead, index: u64) -> Result<Arc<MftEntry>> {
        self.mft()?.get(io, index)
    }

    /// Returns a caller-owned entry, bypassing the cache. Used when the
    /// caller will mutate transient parse state.
    pub fn mft_entry_by_index_uncached(
        &self,
        io: &dyn VolumeRead,
        index: u64,
    ) -> Result<MftEntry> {
        self.mft()?.get_uncached(io, index)
    }

    /// Scans the cluster allocation bitmap and returns the allocated
    /// ranges. The scan is read-only and may run repeatedly.
    pub fn read_bitmap(&self, io: &dyn VolumeRead) -> Result<Vec<ClusterRange>> {
        let mft = self.mft()?;
        bitmap::read_bitmap(&mft, io, &self.geometry, &self.options.cancel)
    }

    /// Loads the $Secure index. Succeeds with an absent index on volumes
    /// that predate security descriptor indexing.
    pub fn read_security_descriptors(&self, io: &dyn VolumeRead) -> Result<()> {
        let mft = self.mft()?;
        let index = SecurityIndex::load(&mft, io, &self.geometry)?;

        let mut state = self.state.write();
        state.security = index.map(Arc::new);
        state.security_loaded = true;
        Ok(())
    }

    /// Resolves a security descriptor identifier. `Ok(None)` covers an
    /// absent index, an unloaded index and an unknown identifier; errors
    /// are reserved for corruption.
    pub fn security_descriptor_by_id(
        &self,
        io: &dyn VolumeRead,
        id: u32,
    ) -> Result<Option<SecurityDescriptor>> {
        let index = {
            let state = self.state.read();
            if !state.security_loaded {
                return Ok(None);
            }
            match &state.security {
                Some(index) => index.clone(),
                None => return Ok(None),
            }
        };
        index.lookup(io, id)
    }

    /// Releases the session's MFT and security index. Fails with
    /// `BusyOnRelease` while shared entry handles are still outstanding;
    /// the caller drops them and retries.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.write();
        if let Some(mft) = &state.mft {
            if Arc::strong_count(mft) > 1 || mft.has_pinned_entries() {
                return Err(FsError::BusyOnRelease);
            }
        }
        *state = State::default();
        Ok(())
    }

    fn mft(&self) -> Result<Arc<Mft>> {
        self.state
            .read()
            .mft
            .clone()
            .ok_or(FsError::MissingValue("master file table"))
    }
}
