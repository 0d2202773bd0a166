use std::io::{Read, Write};
use std::marker::PhantomData;

use borsh::{BorshDeserialize, BorshSerialize};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::delta::CacheDelta;
use crate::descriptor::CacheDescriptor;
use crate::view::CacheView;

/// Failures of cache persistence.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// A serialized payload carries a version tag this build does not know.
    /// Decoding must stop rather than misread the body.
    #[error("serialized payload has unsupported version {version}")]
    UnsupportedVersion {
        /// The unrecognized version tag.
        version: u32,
    },
    /// The storage persists a summary only; individual entries cannot be
    /// written through it.
    #[error("storage persists a summary only and cannot save individual entries")]
    SummaryOnly,
    /// The storage has no cache-wide summary to persist or restore.
    #[error("storage has no cache-wide summary")]
    SummaryUnsupported,
    /// A payload decoded to something structurally impossible.
    #[error("malformed payload: {0}")]
    Malformed(String),
    /// The underlying reader or writer failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Versioned serialization of one entry type.
///
/// Every saved entry starts with a little-endian `u32` version tag; loading
/// reads the tag and dispatches to the matching decoder. Implementations
/// must reject tags they do not recognize with
/// [`StorageError::UnsupportedVersion`] instead of guessing at the body.
pub trait EntryCodec {
    /// The entry type this codec serializes.
    type Entry;

    /// The version written in front of freshly saved entries.
    const VERSION: u32;

    /// Writes the version-`VERSION` body of `entry`.
    fn save_body(&self, entry: &Self::Entry, writer: &mut dyn Write) -> Result<(), StorageError>;

    /// Decodes a body previously written under `version`.
    fn load_body(&self, version: u32, reader: &mut dyn Read) -> Result<Self::Entry, StorageError>;

    /// Writes `entry` with its leading version tag.
    fn save(&self, entry: &Self::Entry, writer: &mut dyn Write) -> Result<(), StorageError> {
        writer.write_u32::<LittleEndian>(Self::VERSION)?;
        self.save_body(entry, writer)
    }

    /// Reads the version tag and decodes the matching body.
    fn load(&self, reader: &mut dyn Read) -> Result<Self::Entry, StorageError> {
        let version = reader.read_u32::<LittleEndian>()?;
        self.load_body(version, reader)
    }

    /// Serializes `entry` to an owned buffer.
    fn to_bytes(&self, entry: &Self::Entry) -> Result<Vec<u8>, StorageError> {
        let mut bytes = Vec::new();
        self.save(entry, &mut bytes)?;
        Ok(bytes)
    }
}

/// An [`EntryCodec`] that writes borsh bodies at version 1.
#[derive(Debug)]
pub struct BorshEntryCodec<E> {
    _entry: PhantomData<E>,
}

impl<E> Default for BorshEntryCodec<E> {
    fn default() -> Self {
        Self {
            _entry: PhantomData,
        }
    }
}

impl<E: BorshSerialize + BorshDeserialize> EntryCodec for BorshEntryCodec<E> {
    type Entry = E;

    const VERSION: u32 = 1;

    fn save_body(
        &self,
        entry: &Self::Entry,
        mut writer: &mut dyn Write,
    ) -> Result<(), StorageError> {
        entry.serialize(&mut writer)?;
        Ok(())
    }

    fn load_body(&self, version: u32, reader: &mut dyn Read) -> Result<Self::Entry, StorageError> {
        if version != Self::VERSION {
            return Err(StorageError::UnsupportedVersion { version });
        }
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;
        Ok(E::try_from_slice(&bytes)?)
    }
}

/// Persistence of one sub-cache.
///
/// `save_all`/`load_all` move the full entry set; `save_summary`/
/// `load_summary` move cache-wide derived state (aggregate counters, index
/// sets) so a restart does not have to replay every entry to rebuild them.
/// A storage that cannot produce one of the two forms must reject the call
/// with the matching typed error ([`StorageError::SummaryOnly`] /
/// [`StorageError::SummaryUnsupported`]); callers distinguish that from
/// success with empty data and fall back accordingly.
pub trait CacheStorage<D: CacheDescriptor>: Send + Sync {
    /// Writes every committed entry of `view`.
    fn save_all(&self, view: &CacheView<D>, writer: &mut dyn Write) -> Result<(), StorageError>;

    /// Replays a `save_all` payload into `delta`.
    fn load_all(&self, reader: &mut dyn Read, delta: &mut CacheDelta<D>)
        -> Result<(), StorageError>;

    /// Writes the cache-wide summary derived from `delta`.
    fn save_summary(
        &self,
        delta: &CacheDelta<D>,
        writer: &mut dyn Write,
    ) -> Result<(), StorageError>;

    /// Restores a previously saved summary into `delta`.
    fn load_summary(
        &self,
        reader: &mut dyn Read,
        delta: &mut CacheDelta<D>,
    ) -> Result<(), StorageError>;
}

/// The standard full-entry storage: a counted sequence of length-prefixed,
/// version-tagged entries. Carries no summary.
#[derive(Debug)]
pub struct FullEntryStorage<D: CacheDescriptor> {
    codec: D::Codec,
}

impl<D: CacheDescriptor> Default for FullEntryStorage<D> {
    fn default() -> Self {
        Self {
            codec: D::Codec::default(),
        }
    }
}

impl<D: CacheDescriptor> CacheStorage<D> for FullEntryStorage<D> {
    fn save_all(&self, view: &CacheView<D>, writer: &mut dyn Write) -> Result<(), StorageError> {
        writer.write_u64::<LittleEndian>(view.len() as u64)?;
        for (_, entry) in view.iter() {
            let bytes = self.codec.to_bytes(entry)?;
            writer.write_u32::<LittleEndian>(bytes.len() as u32)?;
            writer.write_all(&bytes)?;
        }
        Ok(())
    }

    fn load_all(
        &self,
        reader: &mut dyn Read,
        delta: &mut CacheDelta<D>,
    ) -> Result<(), StorageError> {
        let count = reader.read_u64::<LittleEndian>()?;
        for _ in 0..count {
            let length = reader.read_u32::<LittleEndian>()? as usize;
            let mut bytes = vec![0; length];
            reader.read_exact(&mut bytes)?;
            let entry = self.codec.load(&mut bytes.as_slice())?;
            delta.try_insert(entry).map_err(|err| {
                StorageError::Malformed(format!("replayed entry rejected: {err}"))
            })?;
        }
        Ok(())
    }

    fn save_summary(
        &self,
        _delta: &CacheDelta<D>,
        _writer: &mut dyn Write,
    ) -> Result<(), StorageError> {
        Err(StorageError::SummaryUnsupported)
    }

    fn load_summary(
        &self,
        _reader: &mut dyn Read,
        _delta: &mut CacheDelta<D>,
    ) -> Result<(), StorageError> {
        Err(StorageError::SummaryUnsupported)
    }
}
