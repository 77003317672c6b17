use std::collections::BTreeMap;

use anyhow::anyhow;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};


macro_rules! get_checked_impl {
    ($checked_getter: ident, $ty:ty, $getter: ident) => {
        pub fn $checked_getter(buf: &mut impl Buf) -> anyhow::Result<$ty> {
            if buf.remaining() < size_of::<$ty>() {
                return Err(anyhow!("buffer underflow"));
            }
            Ok(buf.$getter())
        }
    }
}

get_checked_impl!(get_u8_checked, u8, get_u8);
get_checked_impl!(get_u32_checked, u32, get_u32);
get_checked_impl!(get_u64_checked, u64, get_u64);

pub fn get_len_checked(buf: &mut impl Buf) -> anyhow::Result<usize> {
    let len = buf.try_get_usize_varint()?;
    if len > buf.remaining() {
        return Err(anyhow!("length prefix {} exceeds remaining {} bytes", len, buf.remaining()));
    }
    Ok(len)
}

pub fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_usize_varint(s.len());
    buf.put_slice(s.as_bytes());
}

pub fn try_get_string(buf: &mut impl Buf) -> anyhow::Result<String> {
    let len = get_len_checked(buf)?;
    let mut result = vec![0u8; len];
    buf.copy_to_slice(&mut result);
    Ok(String::from_utf8(result)?)
}

pub fn put_bytes(buf: &mut BytesMut, data: &[u8]) {
    buf.put_usize_varint(data.len());
    buf.put_slice(data);
}

pub fn try_get_bytes(buf: &mut impl Buf) -> anyhow::Result<Bytes> {
    let len = get_len_checked(buf)?;
    Ok(buf.copy_to_bytes(len))
}

pub fn put_bool(buf: &mut BytesMut, value: bool) {
    buf.put_u8(if value { 1 } else { 0 });
}

pub fn try_get_bool(buf: &mut impl Buf) -> anyhow::Result<bool> {
    match get_u8_checked(buf)? {
        0 => Ok(false),
        1 => Ok(true),
        b => Err(anyhow!("invalid boolean marker {}", b)),
    }
}

pub fn put_opt_string(buf: &mut BytesMut, s: Option<&str>) {
    match s {
        None => put_bool(buf, false),
        Some(s) => {
            put_bool(buf, true);
            put_string(buf, s);
        }
    }
}

pub fn try_get_opt_string(buf: &mut impl Buf) -> anyhow::Result<Option<String>> {
    if try_get_bool(buf)? {
        Ok(Some(try_get_string(buf)?))
    }
    else {
        Ok(None)
    }
}

pub fn put_string_list(buf: &mut BytesMut, list: &[String]) {
    buf.put_usize_varint(list.len());
    for s in list {
        put_string(buf, s);
    }
}

pub fn try_get_string_list(buf: &mut impl Buf) -> anyhow::Result<Vec<String>> {
    // every element takes at least one byte, so this bounds the allocation
    let len = get_len_checked(buf)?;
    let mut result = Vec::with_capacity(len);
    for _ in 0..len {
        result.push(try_get_string(buf)?);
    }
    Ok(result)
}

pub fn put_opt_string_list(buf: &mut BytesMut, list: Option<&[String]>) {
    match list {
        None => put_bool(buf, false),
        Some(list) => {
            put_bool(buf, true);
            put_string_list(buf, list);
        }
    }
}

pub fn try_get_opt_string_list(buf: &mut impl Buf) -> anyhow::Result<Option<Vec<String>>> {
    if try_get_bool(buf)? {
        Ok(Some(try_get_string_list(buf)?))
    }
    else {
        Ok(None)
    }
}

pub fn put_string_map(buf: &mut BytesMut, map: &BTreeMap<String, String>) {
    buf.put_usize_varint(map.len());
    for (k, v) in map {
        put_string(buf, k);
        put_string(buf, v);
    }
}

pub fn try_get_string_map(buf: &mut impl Buf) -> anyhow::Result<BTreeMap<String, String>> {
    let len = get_len_checked(buf)?;
    let mut result = BTreeMap::new();
    for _ in 0..len {
        let k = try_get_string(buf)?;
        let v = try_get_string(buf)?;
        result.insert(k, v);
    }
    Ok(result)
}

pub fn put_bytes_map(buf: &mut BytesMut, map: &BTreeMap<String, Bytes>) {
    buf.put_usize_varint(map.len());
    for (k, v) in map {
        put_string(buf, k);
        put_bytes(buf, v);
    }
}

pub fn try_get_bytes_map(buf: &mut impl Buf) -> anyhow::Result<BTreeMap<String, Bytes>> {
    let len = get_len_checked(buf)?;
    let mut result = BTreeMap::new();
    for _ in 0..len {
        let k = try_get_string(buf)?;
        let v = try_get_bytes(buf)?;
        result.insert(k, v);
    }
    Ok(result)
}
