//! Wire encoding helpers and serialized views.
//!
//! Values cross rank boundaries as bincode; the helpers here mirror the
//! call sites' needs (size preflight for the eager/rendezvous decision,
//! anyhow at the boundary). [`View`] is a first-class serializable range
//! over contiguous elements that references the inbound message buffer
//! without copying: the dispatcher pins the buffer for the duration of
//! argument deserialization and a view landing inside it keeps a
//! ref-counted slice of that buffer instead of materializing its bytes.

use std::cell::RefCell;
use std::io::Cursor;
use std::marker::PhantomData;
use std::ops::Range;
use std::sync::Arc;

use serde::de::{DeserializeOwned, Deserializer};
use serde::ser::{SerializeTuple, Serializer};
use serde::{Deserialize, Serialize};

/// Marker for types that may cross rank boundaries.
pub trait Dist: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static> Dist for T {}

pub fn serialize<T: ?Sized>(obj: &T) -> Result<Vec<u8>, anyhow::Error>
where
    T: Serialize,
{
    Ok(bincode::serialize(obj)?)
}

pub fn serialized_size<T: ?Sized>(obj: &T) -> usize
where
    T: Serialize,
{
    bincode::serialized_size(obj).expect("serialized_size") as usize
}

pub fn serialize_into<T: ?Sized>(buf: &mut [u8], obj: &T) -> Result<(), anyhow::Error>
where
    T: Serialize,
{
    bincode::serialize_into(buf, obj)?;
    Ok(())
}

pub fn deserialize<'a, T>(bytes: &'a [u8]) -> Result<T, anyhow::Error>
where
    T: Deserialize<'a>,
{
    Ok(bincode::deserialize(bytes)?)
}

thread_local! {
    // The inbound message buffer currently being unpacked on this
    // thread, pinned so views can adopt slices of it.
    static INBOUND_BUF: RefCell<Option<Arc<[u8]>>> = RefCell::new(None);
}

/// Run `f` with `buf` pinned as the inbound buffer: any [`View`]
/// deserialized inside adopts a ref-counted slice of `buf` instead of
/// copying. Nests; the previous pin is restored on exit.
pub(crate) fn with_inbound<R>(buf: &Arc<[u8]>, f: impl FnOnce() -> R) -> R {
    struct Restore(Option<Arc<[u8]>>);
    impl Drop for Restore {
        fn drop(&mut self) {
            let prev = self.0.take();
            INBOUND_BUF.with(|cell| *cell.borrow_mut() = prev);
        }
    }
    let _restore = Restore(INBOUND_BUF.with(|cell| cell.borrow_mut().replace(buf.clone())));
    f()
}

/// Backing storage of a view: a ref-counted slice of the inbound
/// message buffer when the view was unpacked from the wire, or owned
/// bytes when it was built locally (or unpacked outside any inbound
/// buffer, e.g. a value smuggled through a reply).
#[derive(Clone, Debug)]
enum ViewBytes {
    Owned(Vec<u8>),
    Shared(Arc<[u8]>, Range<usize>),
}

impl ViewBytes {
    fn adopt(bytes: &[u8]) -> ViewBytes {
        INBOUND_BUF.with(|cell| {
            if let Some(buf) = cell.borrow().as_ref() {
                let base = buf.as_ptr() as usize;
                let p = bytes.as_ptr() as usize;
                if p >= base && p + bytes.len() <= base + buf.len() {
                    let off = p - base;
                    return ViewBytes::Shared(buf.clone(), off..off + bytes.len());
                }
            }
            ViewBytes::Owned(bytes.to_vec())
        })
    }

    fn as_slice(&self) -> &[u8] {
        match self {
            ViewBytes::Owned(bytes) => bytes,
            ViewBytes::Shared(buf, range) => &buf[range.clone()],
        }
    }
}

/// A read-only range over serialized contiguous elements.
///
/// On the wire a view is a count plus the packed element encoding. A
/// deserialized view references the inbound buffer it arrived in
/// (keeping it alive by ref-count) and decodes elements on iteration;
/// nothing is copied out of the buffer.
#[derive(Clone, Debug)]
pub struct View<T: Dist> {
    len: usize,
    bytes: ViewBytes,
    _elem: PhantomData<fn() -> T>,
}

impl<T: Dist> View<T> {
    /// Pack a slice into its on-wire view form.
    pub fn new(elems: &[T]) -> View<T> {
        let mut bytes = Vec::new();
        for e in elems {
            bytes.extend_from_slice(&bincode::serialize(e).expect("view element serialize"));
        }
        View {
            len: elems.len(),
            bytes: ViewBytes::Owned(bytes),
            _elem: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether this view borrows the inbound message buffer it was
    /// deserialized from (as opposed to owning its bytes).
    pub fn references_buffer(&self) -> bool {
        matches!(self.bytes, ViewBytes::Shared(..))
    }

    /// Decode the elements in order.
    pub fn iter(&self) -> ViewIter<'_, T> {
        ViewIter {
            cursor: Cursor::new(self.bytes.as_slice()),
            remaining: self.len,
            _elem: PhantomData,
        }
    }
}

impl<T: Dist> Serialize for View<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tup = serializer.serialize_tuple(2)?;
        tup.serialize_element(&self.len)?;
        tup.serialize_element(serde_bytes::Bytes::new(self.bytes.as_slice()))?;
        tup.end()
    }
}

impl<'de, T: Dist> Deserialize<'de> for View<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // borrow the byte run straight out of the deserializer's input;
        // adopt() decides whether the pinned inbound buffer covers it
        let (len, bytes): (usize, &'de [u8]) = Deserialize::deserialize(deserializer)?;
        Ok(View {
            len,
            bytes: ViewBytes::adopt(bytes),
            _elem: PhantomData,
        })
    }
}

pub struct ViewIter<'a, T> {
    cursor: Cursor<&'a [u8]>,
    remaining: usize,
    _elem: PhantomData<fn() -> T>,
}

impl<'a, T: Dist> Iterator for ViewIter<'a, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        Some(bincode::deserialize_from(&mut self.cursor).expect("view element decode"))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<'a, T: Dist> ExactSizeIterator for ViewIter<'a, T> {}

impl<'a, T: Dist> IntoIterator for &'a View<T> {
    type Item = T;
    type IntoIter = ViewIter<'a, T>;

    fn into_iter(self) -> ViewIter<'a, T> {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn view_roundtrip() {
        let data: Vec<i32> = (0..10).collect();
        let view = View::new(&data);
        let bytes = serialize(&view).unwrap();
        let back: View<i32> = deserialize(&bytes).unwrap();
        assert_eq!(back.len(), 10);
        let items: Vec<i32> = back.iter().collect();
        assert_eq!(items, data);
    }

    #[test]
    fn view_adopts_the_pinned_inbound_buffer() {
        let data: Vec<i32> = (0..16).collect();
        let wire: Arc<[u8]> = serialize(&View::new(&data)).unwrap().into();
        let back: View<i32> = with_inbound(&wire, || deserialize(&wire).unwrap());
        assert!(back.references_buffer(), "view must borrow the inbound buffer");
        assert_eq!(back.iter().collect::<Vec<i32>>(), data);
        // the adopted slice aliases the wire bytes, not a copy
        let base = wire.as_ptr() as usize;
        match &back.bytes {
            ViewBytes::Shared(buf, range) => {
                assert_eq!(buf.as_ptr() as usize, base);
                assert!(range.end <= wire.len());
            }
            ViewBytes::Owned(_) => panic!("expected a shared slice"),
        }
    }

    #[test]
    fn view_owns_its_bytes_outside_an_inbound_window() {
        let data: Vec<i32> = (0..4).collect();
        let wire = serialize(&View::new(&data)).unwrap();
        let back: View<i32> = deserialize(&wire).unwrap();
        assert!(!back.references_buffer());
        assert_eq!(back.iter().collect::<Vec<i32>>(), data);
    }

    #[test]
    fn view_of_structs() {
        #[derive(Serialize, serde::Deserialize, Clone, PartialEq, Debug)]
        struct P {
            x: u8,
            y: i64,
        }
        let data = vec![P { x: 1, y: -1 }, P { x: 2, y: -2 }];
        let view = View::new(&data);
        let wire: Arc<[u8]> = serialize(&view).unwrap().into();
        let back: View<P> = with_inbound(&wire, || deserialize(&wire).unwrap());
        assert!(back.references_buffer());
        assert_eq!(back.iter().collect::<Vec<_>>(), data);
    }
}
