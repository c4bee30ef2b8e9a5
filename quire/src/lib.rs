/*!
Indirect-object resolution for progressively downloaded PDF files.

A PDF names its contents through indirect objects: a catalog points at a
page tree, pages point at their resources, and everything is tied together
by a cross-reference table mapping object numbers to byte offsets. This
crate resolves those references without requiring the whole file up front.
Bytes live in a [`ChunkedSource`] that fills in fixed-size chunks, in any
order; every parser in the crate reads through it and reports exactly which
bytes it is missing, so a resolution can be suspended, the missing chunks
fetched over a [`RangeTransport`], and the resolution re-run.

The crate covers:

- classic `xref` tables and cross-reference streams, including `/Prev`
  chains, hybrid files and object streams;
- a recovery scan that rebuilds the table from the raw bytes when the
  regular machinery is broken;
- an owned object model ([`Object`], [`Dict`], [`Stream`]) with cached,
  cycle-safe resolution through the [`XRef`] table;
- an async session ([`Pdf`]) that couples the synchronous parsers to a
  chunk-fetching transport;
- the write side ([`write`]) for serializing objects and appending
  cross-reference sections.

Decryption is pluggable: the host installs a [`Decryptor`] and the crate
applies it to strings and stream data as objects are fetched. Content
interpretation (page rendering, fonts, color) is out of scope; this crate
stops at handing out resolved objects.
*/

pub mod chunk;
mod crypto;
mod error;
mod filter;
pub mod manager;
pub mod object;
mod pdf;
pub mod reader;
mod recover;
pub(crate) mod trivia;
pub mod write;
pub mod xref;

pub use chunk::ChunkedSource;
pub use crypto::{DecryptionTarget, Decryptor};
pub use error::{Error, Result};
pub use manager::{ChunkManager, RangeTransport};
pub use object::dict::Dict;
pub use object::stream::Stream;
pub use object::{Name, ObjRef, Object};
pub use pdf::Pdf;
pub use xref::{XRef, XRefEntry};
