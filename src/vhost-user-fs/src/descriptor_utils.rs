//! Bulk memcpy between scatter/gather vectors (`spec.md` §4.A).
//!
//! Pure byte-slice operations, deliberately decoupled from guest memory so
//! they can be unit tested directly (`spec.md` §8 L1/L2) and so the worker
//! (`worker.rs`) can reuse them for both guest-memory iovecs and the
//! session's bounce buffer. Callers must pre-validate sizes; these panic on
//! an oversized request rather than silently truncating, per §4.A
//! ("behavior on oversized requests is undefined").

use std::cmp::min;

/// Gather-copy `src` into a contiguous buffer. Returns the number of bytes
/// written, which is `min(sum(src lens), dst.len())`.
pub fn gather_copy(src: &[&[u8]], dst: &mut [u8]) -> usize {
    let mut written = 0;
    for seg in src {
        if written >= dst.len() {
            break;
        }
        let n = min(seg.len(), dst.len() - written);
        dst[written..written + n].copy_from_slice(&seg[..n]);
        written += n;
    }
    written
}

/// Scatter-copy a contiguous buffer into `dst`. The inverse of
/// [`gather_copy`]; `L2` holds when `dst`'s shape matches the `src` shape
/// the buffer was gathered from.
pub fn scatter_copy(src: &[u8], dst: &mut [&mut [u8]]) -> usize {
    let mut written = 0;
    for seg in dst.iter_mut() {
        if written >= src.len() {
            break;
        }
        let n = min(seg.len(), src.len() - written);
        seg[..n].copy_from_slice(&src[written..written + n]);
        written += n;
    }
    written
}

/// Total length available across a set of iovec segments.
pub fn total_len(iov: &[&[u8]]) -> usize {
    iov.iter().map(|s| s.len()).sum()
}

pub fn total_len_mut(iov: &[&mut [u8]]) -> usize {
    iov.iter().map(|s| s.len()).sum()
}

/// Copy exactly `len` bytes from `src` to `dst`, each an arbitrarily
/// segmented iovec array. Source and destination cursors advance
/// independently; whichever segment fills first is stepped to the next one,
/// on both sides. Panics (via `assert!`) if either side runs out of room
/// before `len` bytes have moved — the caller is required to have checked
/// `total_len(src) >= len` and the equivalent for `dst`.
pub fn iovec_copy(src: &[&[u8]], dst: &mut [&mut [u8]], len: usize) {
    let mut si = 0usize;
    let mut soff = 0usize;
    let mut di = 0usize;
    let mut doff = 0usize;
    let mut remaining = len;

    while remaining > 0 {
        assert!(si < src.len(), "iovec_copy: source exhausted with bytes remaining");
        assert!(di < dst.len(), "iovec_copy: destination exhausted with bytes remaining");

        let s = &src[si][soff..];
        if s.is_empty() {
            si += 1;
            soff = 0;
            continue;
        }
        let d = &mut dst[di][doff..];
        if d.is_empty() {
            di += 1;
            doff = 0;
            continue;
        }

        let n = min(min(s.len(), d.len()), remaining);
        d[..n].copy_from_slice(&s[..n]);

        soff += n;
        doff += n;
        remaining -= n;

        if soff == src[si].len() {
            si += 1;
            soff = 0;
        }
        if doff == dst[di].len() {
            di += 1;
            doff = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg_bufs(shape: &[usize], fill: impl Fn(usize) -> u8) -> Vec<Vec<u8>> {
        let mut counter = 0usize;
        shape
            .iter()
            .map(|&n| {
                let v: Vec<u8> = (0..n)
                    .map(|_| {
                        let b = fill(counter);
                        counter += 1;
                        b
                    })
                    .collect();
                v
            })
            .collect()
    }

    #[test]
    fn gather_then_scatter_is_identity() {
        // L2: gather into a contiguous buffer, then scatter into an iovec
        // array of identical shape, reproduces the original bytes.
        let shape = [3usize, 1, 5, 2];
        let bufs = seg_bufs(&shape, |i| (i % 251) as u8);
        let refs: Vec<&[u8]> = bufs.iter().map(|b| b.as_slice()).collect();
        let total = total_len(&refs);

        let mut flat = vec![0u8; total];
        let written = gather_copy(&refs, &mut flat);
        assert_eq!(written, total);

        let mut out_bufs: Vec<Vec<u8>> = shape.iter().map(|&n| vec![0u8; n]).collect();
        let mut out_refs: Vec<&mut [u8]> = out_bufs.iter_mut().map(|b| b.as_mut_slice()).collect();
        let scattered = scatter_copy(&flat, &mut out_refs);
        assert_eq!(scattered, total);

        for (orig, out) in bufs.iter().zip(out_bufs.iter()) {
            assert_eq!(orig, out);
        }
    }

    #[test]
    fn iovec_roundtrip_survives_misaligned_boundaries() {
        // L1: copy N bytes A -> B, then B -> A, across differently shaped
        // iovecs, reproduces the original content regardless of alignment.
        let a_shape = [7usize, 3, 1];
        let b_shape = [2usize, 4, 5];
        let a_bufs = seg_bufs(&a_shape, |i| (i * 7 % 256) as u8);
        let total: usize = a_shape.iter().sum();
        assert_eq!(total, b_shape.iter().sum::<usize>());

        let mut b_bufs: Vec<Vec<u8>> = b_shape.iter().map(|&n| vec![0u8; n]).collect();
        {
            let a_refs: Vec<&[u8]> = a_bufs.iter().map(|v| v.as_slice()).collect();
            let mut b_refs: Vec<&mut [u8]> = b_bufs.iter_mut().map(|v| v.as_mut_slice()).collect();
            iovec_copy(&a_refs, &mut b_refs, total);
        }

        let mut a2_bufs: Vec<Vec<u8>> = a_shape.iter().map(|&n| vec![0u8; n]).collect();
        {
            let b_refs: Vec<&[u8]> = b_bufs.iter().map(|v| v.as_slice()).collect();
            let mut a2_refs: Vec<&mut [u8]> = a2_bufs.iter_mut().map(|v| v.as_mut_slice()).collect();
            iovec_copy(&b_refs, &mut a2_refs, total);
        }

        for (orig, back) in a_bufs.iter().zip(a2_bufs.iter()) {
            assert_eq!(orig, back);
        }
    }

    #[test]
    #[should_panic(expected = "destination exhausted")]
    fn iovec_copy_panics_on_undersized_dest() {
        let src: Vec<&[u8]> = vec![&[1, 2, 3, 4]];
        let mut d = vec![0u8; 2];
        let mut dst: Vec<&mut [u8]> = vec![&mut d];
        iovec_copy(&src, &mut dst, 4);
    }
}
