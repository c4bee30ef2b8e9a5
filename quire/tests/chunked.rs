//! End-to-end tests driving documents through a chunked transport.

use quire::{ChunkManager, ChunkedSource, Error, ObjRef, Object, Pdf, RangeTransport};
use std::fmt::Write as _;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Serves ranges out of an in-memory document, counting the calls.
struct RecordingTransport {
    data: Vec<u8>,
    calls: AtomicUsize,
}

impl RecordingTransport {
    fn new(data: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            data,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl RangeTransport for RecordingTransport {
    fn fetch(
        &self,
        begin: usize,
        end: usize,
    ) -> Pin<Box<dyn Future<Output = std::io::Result<Vec<u8>>> + Send + '_>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let bytes = self.data[begin..end].to_vec();

        Box::pin(async move { Ok(bytes) })
    }
}

fn pad_to(buf: &mut Vec<u8>, target: usize) {
    assert!(buf.len() + 2 <= target);

    buf.push(b'%');
    while buf.len() < target - 1 {
        buf.push(b'p');
    }
    buf.push(b'\n');
}

/// A document spread over seven 1024-byte chunks: the catalog in chunk 0,
/// the page in chunk 1, a long array straddling the chunk 1/2 boundary, and
/// the table at the tail.
fn spread_doc() -> Vec<u8> {
    let mut buf = b"%PDF-1.7\n".to_vec();
    let mut offsets = vec![];

    offsets.push(buf.len());
    buf.extend_from_slice(b"1 0 obj\n<< /Type /Catalog /Pages 2 0 R >>\nendobj\n");
    offsets.push(buf.len());
    buf.extend_from_slice(b"2 0 obj\n<< /Type /Pages /Kids [3 0 R] /Count 1 >>\nendobj\n");

    pad_to(&mut buf, 1100);
    offsets.push(buf.len());
    buf.extend_from_slice(b"3 0 obj\n<< /Type /Page /Parent 2 0 R >>\nendobj\n");

    pad_to(&mut buf, 2020);
    offsets.push(buf.len());
    buf.extend_from_slice(b"4 0 obj\n[");
    for _ in 0..40 {
        buf.extend_from_slice(b"7 ");
    }
    buf.extend_from_slice(b"]\nendobj\n");

    pad_to(&mut buf, 6500);
    let xref_pos = buf.len();

    let mut table = String::from("xref\n0 5\n0000000000 65535 f \n");
    for offset in &offsets {
        writeln!(table, "{offset:010} 00000 n ").unwrap();
    }
    write!(
        table,
        "trailer\n<< /Size 5 /Root 1 0 R >>\nstartxref\n{xref_pos}\n%%EOF"
    )
    .unwrap();
    buf.extend_from_slice(table.as_bytes());

    buf
}

/// Assemble a fully classic document from numbered object bodies.
fn classic_doc(bodies: &[(u32, String)]) -> Vec<u8> {
    let mut buf = String::from("%PDF-1.7\n");
    let mut offsets = vec![];

    for (num, body) in bodies {
        offsets.push((*num, buf.len()));
        writeln!(buf, "{num} 0 obj\n{body}\nendobj").unwrap();
    }

    let max = bodies.iter().map(|(n, _)| *n).max().unwrap_or(0);
    let xref_pos = buf.len();

    writeln!(buf, "xref\n0 {}", max + 1).unwrap();
    buf.push_str("0000000000 65535 f \n");

    for num in 1..=max {
        match offsets.iter().find(|(n, _)| *n == num) {
            Some((_, offset)) => writeln!(buf, "{offset:010} 00000 n ").unwrap(),
            None => buf.push_str("0000000000 65535 f \n"),
        }
    }

    write!(
        buf,
        "trailer\n<< /Size {} /Root 1 0 R >>\nstartxref\n{xref_pos}\n%%EOF",
        max + 1
    )
    .unwrap();

    buf.into_bytes()
}

async fn open_spread() -> (Arc<ChunkedSource>, Arc<RecordingTransport>, Pdf) {
    let doc = spread_doc();
    let len = doc.len();
    let transport = RecordingTransport::new(doc);
    let source = Arc::new(ChunkedSource::new(len, 1024));
    let manager = ChunkManager::new(source.clone(), transport.clone(), false);

    let pdf = Pdf::new(manager);
    pdf.load().await.unwrap();

    (source, transport, pdf)
}

#[tokio::test]
async fn loads_lazily_over_a_transport() {
    let (source, transport, pdf) = open_spread().await;

    // Loading touched the tail window and the catalog chunk, nothing else.
    assert!(!source.is_fully_loaded());
    assert_eq!(source.missing_chunks(), vec![1, 2, 3]);
    let calls_after_load = transport.calls();

    // The page lives in chunk 1; resolving it costs exactly one more call.
    let page = pdf
        .fetch_async(ObjRef::new(3, 0))
        .await
        .unwrap()
        .into_dict()
        .unwrap();
    assert_eq!(page.get_ref(b"Parent"), Some(ObjRef::new(2, 0)));
    assert_eq!(transport.calls(), calls_after_load + 1);
    assert_eq!(source.missing_chunks(), vec![2, 3]);
}

#[tokio::test]
async fn resolves_objects_spanning_chunk_boundaries() {
    let (_, _, pdf) = open_spread().await;

    let arr = pdf
        .fetch_async(ObjRef::new(4, 0))
        .await
        .unwrap()
        .into_array()
        .unwrap();
    assert_eq!(arr.len(), 40);
    assert!(arr.iter().all(|o| *o == Object::Int(7)));
}

#[tokio::test]
async fn repeated_fetches_share_the_cached_object() {
    let (_, transport, pdf) = open_spread().await;

    let a = pdf
        .fetch_async(ObjRef::new(4, 0))
        .await
        .unwrap()
        .into_array()
        .unwrap();
    let calls = transport.calls();

    let b = pdf
        .fetch_async(ObjRef::new(4, 0))
        .await
        .unwrap()
        .into_array()
        .unwrap();

    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(transport.calls(), calls);
}

#[tokio::test]
async fn dictionary_values_resolve_through_the_session() {
    let (_, _, pdf) = open_spread().await;

    let catalog = pdf.catalog().unwrap();
    let pages = pdf
        .get_value_async(&catalog, b"Pages")
        .await
        .unwrap()
        .and_then(Object::into_dict)
        .unwrap();
    assert_eq!(
        pages.get_raw(b"Count"),
        Some(&Object::Int(1))
    );

    let kid = pdf
        .fetch_if_ref_async(Object::Ref(ObjRef::new(3, 0)))
        .await
        .unwrap();
    assert!(kid.into_dict().is_some());
}

#[tokio::test]
async fn abort_fails_later_fetches() {
    let (_, _, pdf) = open_spread().await;

    pdf.abort("viewer closed");

    match pdf.fetch_async(ObjRef::new(3, 0)).await {
        Err(Error::Aborted(reason)) => assert_eq!(reason, "viewer closed"),
        other => panic!("expected abort, got {other:?}"),
    }
}

#[tokio::test]
async fn progressive_delivery_needs_no_transport() {
    let doc = spread_doc();
    let len = doc.len();
    let transport = RecordingTransport::new(doc.clone());
    let source = Arc::new(ChunkedSource::new(len, 1024));

    // The bytes stream in from the front, as from a plain download.
    let (first, second) = doc.split_at(len / 2);
    source.receive_progressive(first);
    source.receive_progressive(second);
    assert!(source.is_fully_loaded());

    let manager = ChunkManager::new(source, transport.clone(), false);
    let pdf = Pdf::new(manager);
    pdf.load().await.unwrap();

    assert!(pdf.catalog().is_ok());
    assert_eq!(transport.calls(), 0);
}

#[tokio::test]
async fn deep_reference_chains_terminate() {
    let mut bodies = vec![
        (1, "<< /Type /Catalog /Pages 2 0 R >>".to_string()),
        (2, "<< /Type /Pages /Kids [] /Count 0 >>".to_string()),
    ];

    // Objects 4..=53 form a 50-step reference cycle.
    for num in 4..53 {
        bodies.push((num, format!("{} 0 R", num + 1)));
    }
    bodies.push((53, "4 0 R".to_string()));

    let pdf = Pdf::from_bytes(&classic_doc(&bodies), 512).unwrap();

    assert_eq!(
        pdf.fetch_async(ObjRef::new(4, 0)).await.unwrap(),
        Object::Circular
    );
}

#[tokio::test]
async fn recovery_fetches_the_whole_document() {
    let mut doc = spread_doc();

    // Break the startxref pointer so loading has to fall back to a scan,
    // which needs every byte.
    let pos = doc
        .windows(9)
        .rposition(|w| w == b"startxref")
        .unwrap();
    doc[pos..pos + 9].copy_from_slice(b"startnope");

    let len = doc.len();
    let transport = RecordingTransport::new(doc);
    let source = Arc::new(ChunkedSource::new(len, 1024));
    let manager = ChunkManager::new(source.clone(), transport, false);

    let pdf = Pdf::new(manager);
    pdf.load().await.unwrap();

    assert!(pdf.xref().is_recovered());
    assert!(source.is_fully_loaded());
    assert!(pdf.catalog().is_ok());
}
