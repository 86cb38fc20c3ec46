//! Talos - NTFS metadata runtime
//!
//! A read-only parser for the on-disk structures of NTFS volumes held in a
//! seekable byte source (raw disk, partition image, or metadata dump),
//! built for forensic and interoperability use. The runtime reads the
//! Master File Table through a bounded cache, presents non-resident
//! attribute streams as linear byte views, decodes the cluster allocation
//! bitmap and resolves security descriptors through $Secure.
//!
//! A session starts from a [`VolumeGeometry`] (supplied by the volume
//! opener) and a [`VolumeRead`] source:
//!
//! ```ignore
//! let image = MmapImage::open("/evidence/volume.img")?;
//! let fs = FileSystem::new(geometry);
//! fs.read_mft(&image, geometry.mft_offset, mft_size, MftReadFlags::empty())?;
//! let entry = fs.mft_entry_by_index(&image, 5)?;
//! ```

pub mod attribute;
pub mod bitmap;
pub mod cancel;
pub mod entry;
pub mod error;
pub mod file_system;
pub mod fixup;
pub mod io;
pub mod mft;
pub mod runs;
pub mod security;
pub mod stream;

mod lznt1;

pub use attribute::{Attribute, AttributeBody, AttributeFlags, AttributeKind};
pub use bitmap::ClusterRange;
pub use cancel::CancelToken;
pub use entry::{EntryFlags, FileReference, MftEntry};
pub use error::{FsError, Result};
pub use file_system::{FileSystem, FileSystemOptions, DEFAULT_CACHE_CAPACITY};
pub use io::{FileImage, MemImage, MmapImage, VolumeGeometry, VolumeRead};
pub use mft::MftReadFlags;
pub use runs::DataRun;
pub use security::{AclSummary, SecurityDescriptor, Sid};
pub use stream::ClusterStream;
