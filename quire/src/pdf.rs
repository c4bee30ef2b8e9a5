//! The document facade: opening, validation, and the async resolution
//! session.

use crate::chunk::ChunkedSource;
use crate::error::{Error, Result};
use crate::manager::{ChunkManager, RangeTransport};
use crate::object::dict::Dict;
use crate::object::dict::keys::{COUNT, ENCRYPT, PAGES};
use crate::object::{ObjRef, Object};
use crate::recover::recover;
use crate::xref::XRef;
use log::warn;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// A transport for documents that are already fully in memory. Never
/// called, since nothing is missing.
struct NullTransport;

impl RangeTransport for NullTransport {
    fn fetch(
        &self,
        _: usize,
        _: usize,
    ) -> Pin<Box<dyn Future<Output = std::io::Result<Vec<u8>>> + Send + '_>> {
        Box::pin(async { Err(std::io::Error::other("document has no transport")) })
    }
}

/// A document whose objects resolve on demand while its bytes are still
/// arriving.
///
/// The synchronous accessors fail with [`Error::Unavailable`] when they hit
/// missing bytes; the `_async` counterparts catch that, fetch the missing
/// range through the [`ChunkManager`] and re-run the access.
pub struct Pdf {
    source: Arc<ChunkedSource>,
    manager: Arc<ChunkManager>,
    xref: Arc<XRef>,
}

impl Pdf {
    /// Wrap an existing manager without loading anything yet. Call
    /// [`load`](Self::load) before resolving objects.
    pub fn new(manager: Arc<ChunkManager>) -> Self {
        let source = manager.source().clone();
        let xref = Arc::new(XRef::new(source.clone()));

        Self {
            source,
            manager,
            xref,
        }
    }

    /// Open a document of `len` bytes over a transport, fetching what the
    /// cross-reference machinery needs.
    pub async fn open(
        transport: Arc<dyn RangeTransport>,
        len: usize,
        chunk_size: usize,
    ) -> Result<Self> {
        let source = Arc::new(ChunkedSource::new(len, chunk_size));
        let manager = ChunkManager::new(source, transport, true);

        let pdf = Self::new(manager);
        pdf.load().await?;

        Ok(pdf)
    }

    /// Open a fully in-memory document.
    pub fn from_bytes(data: &[u8], chunk_size: usize) -> Result<Self> {
        let source = Arc::new(ChunkedSource::from_bytes(data, chunk_size));
        let manager = ChunkManager::new(source, Arc::new(NullTransport), false);

        let pdf = Self::new(manager);

        if let Err(e) = pdf.xref.parse() {
            warn!("cross-reference parse failed ({e}); scanning the document");
            recover(&pdf.xref)?;
        }

        pdf.validate_sync()?;

        Ok(pdf)
    }

    /// Parse the cross-reference table, falling back to a document scan,
    /// and validate the catalog.
    pub async fn load(&self) -> Result<()> {
        match self.with_retry(|| self.xref.parse()).await {
            Ok(()) => {}
            Err(e @ (Error::Aborted(_) | Error::Transport(_))) => return Err(e),
            Err(e) => {
                warn!("cross-reference parse failed ({e}); scanning the document");
                self.with_retry(|| recover(&self.xref)).await?;
            }
        }

        self.validate_async().await
    }

    async fn validate_async(&self) -> Result<()> {
        match self.with_retry(|| self.check_catalog()).await {
            Ok(()) => Ok(()),
            Err(e @ (Error::Aborted(_) | Error::Transport(_))) => Err(e),
            Err(e) if !self.xref.is_recovered() => {
                warn!("catalog did not check out ({e}); scanning the document");
                self.with_retry(|| recover(&self.xref)).await?;

                match self.with_retry(|| self.check_catalog()).await {
                    Ok(()) => Ok(()),
                    Err(e @ (Error::Aborted(_) | Error::Transport(_))) => Err(e),
                    Err(_) => Err(Error::NoTrailer),
                }
            }
            Err(_) => Err(Error::NoTrailer),
        }
    }

    /// Synchronous version of the load-time validation, for in-memory
    /// documents.
    fn validate_sync(&self) -> Result<()> {
        match self.check_catalog() {
            Ok(()) => Ok(()),
            Err(_) if !self.xref.is_recovered() => {
                recover(&self.xref)?;

                self.check_catalog().map_err(|_| Error::NoTrailer)
            }
            Err(_) => Err(Error::NoTrailer),
        }
    }

    /// Verify that the trailer leads to a usable catalog: `/Root` must
    /// resolve to a dictionary whose `/Pages` tree has an integer `/Count`.
    fn check_catalog(&self) -> Result<()> {
        let root = self.xref.root_ref().ok_or(Error::NoTrailer)?;

        let catalog = self
            .xref
            .fetch(root, false)?
            .into_dict()
            .ok_or(Error::Format("catalog is not a dictionary"))?;

        let pages = catalog
            .get(PAGES, &self.xref)?
            .and_then(Object::into_dict)
            .ok_or(Error::Format("catalog has no page tree"))?;

        pages
            .get(COUNT, &self.xref)?
            .and_then(|obj| obj.as_int())
            .map(|_| ())
            .ok_or(Error::Format("page tree has no page count"))
    }

    /// The chunked byte source backing this document.
    pub fn source(&self) -> &Arc<ChunkedSource> {
        &self.source
    }

    /// The request coordinator of this document.
    pub fn manager(&self) -> &Arc<ChunkManager> {
        &self.manager
    }

    /// The cross-reference table of this document.
    pub fn xref(&self) -> &Arc<XRef> {
        &self.xref
    }

    /// The document version from the file header, as `(major, minor)`.
    pub fn version(&self) -> Option<(u8, u8)> {
        let head = self.source.read_range(0, 16).ok()?;
        let rest = head.strip_prefix(b"%PDF-")?;

        match rest {
            [major, b'.', minor, ..] if major.is_ascii_digit() && minor.is_ascii_digit() => {
                Some((major - b'0', minor - b'0'))
            }
            _ => None,
        }
    }

    /// The document catalog.
    pub fn catalog(&self) -> Result<Dict> {
        let root = self.xref.root_ref().ok_or(Error::NoTrailer)?;

        self.xref
            .fetch(root, false)?
            .into_dict()
            .ok_or(Error::Format("catalog is not a dictionary"))
    }

    /// The `/Encrypt` dictionary of the trailer, with decryption suppressed
    /// for everything resolved through it.
    pub fn encrypt_dict(&self) -> Result<Option<Dict>> {
        let Some(trailer) = self.xref.trailer() else {
            return Ok(None);
        };

        let dict = match trailer.get_raw(ENCRYPT) {
            None => return Ok(None),
            Some(Object::Ref(id)) => self.xref.fetch(*id, true)?.into_dict(),
            Some(obj) => obj.clone().into_dict(),
        };

        if let Some(dict) = &dict {
            dict.set_suppress_decryption();
        }

        Ok(dict)
    }

    /// Resolve a reference.
    pub fn fetch(&self, id: ObjRef) -> Result<Object> {
        self.xref.fetch(id, false)
    }

    /// Resolve a reference, fetching missing bytes as needed.
    pub async fn fetch_async(&self, id: ObjRef) -> Result<Object> {
        self.with_retry(|| self.xref.fetch(id, false)).await
    }

    /// Dereference `obj` if it is a reference.
    pub fn fetch_if_ref(&self, obj: Object) -> Result<Object> {
        self.xref.resolve(obj)
    }

    /// Dereference `obj` if it is a reference, fetching missing bytes as
    /// needed.
    pub async fn fetch_if_ref_async(&self, obj: Object) -> Result<Object> {
        self.with_retry(|| self.xref.resolve(obj.clone())).await
    }

    /// Resolve a dictionary entry, fetching missing bytes as needed.
    pub async fn get_value_async(&self, dict: &Dict, key: &[u8]) -> Result<Option<Object>> {
        self.with_retry(|| dict.get(key, &self.xref)).await
    }

    /// Fail all outstanding requests and refuse new ones.
    pub fn abort(&self, reason: &str) {
        self.manager.abort(reason);
    }

    /// Run a synchronous resolution step, fetching whatever ranges it
    /// reports missing and re-running it until it completes.
    ///
    /// Steps must be restartable: they re-read everything they need on each
    /// run and only commit state when they return `Ok`.
    pub async fn with_retry<T>(&self, mut f: impl FnMut() -> Result<T>) -> Result<T> {
        let mut last: Option<(usize, usize, usize)> = None;

        loop {
            match f() {
                Err(Error::Unavailable { begin, end }) => {
                    // A step that reports the same missing range twice
                    // without new data arriving would spin forever.
                    let resident = self.source.resident_chunks();

                    if last == Some((begin, end, resident)) {
                        warn!("no progress fetching {begin}..{end}; giving up");

                        return Err(Error::Unavailable { begin, end });
                    }
                    last = Some((begin, end, resident));

                    self.manager.request_range(begin, end).await?;
                }
                other => return other,
            }
        }
    }
}
