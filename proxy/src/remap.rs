//! Active object remove/add rewriting
//!
//! TOCLIENT_ACTIVE_OBJECT_REMOVE_ADD layout after the opcode:
//!
//! ```text
//! u16 removed count, then one u16 id per removed object
//! u16 added count, then per added object:
//!     u16 id, u8 type, u32 init data length, init data
//!     (init data: u8 version, u16 name length, name, ...)
//! ```
//!
//! A client keeps one session while the proxy may move it between backends,
//! and every backend announces the player's own object. The client must see
//! that self entry exactly once, so later ones are cut out of the packet.

use crate::peer::Peer;
use shared::{Reader, WireError};
use std::ops::Range;

/// Name embedded in an object's init data, if the init data carries one
fn object_name(init: &[u8]) -> Option<&[u8]> {
    let mut r = Reader::new(init);
    r.skip(1).ok()?;
    r.string16().ok()
}

/// Rewrites one remove/add payload destined for `peer`.
///
/// The whole payload is validated before anything is changed; on a framing
/// error neither the payload nor the peer is touched.
pub fn remap_active_objects(peer: &Peer, data: &[u8]) -> Result<Vec<u8>, WireError> {
    let username = peer.username().map(str::as_bytes);

    let mut r = Reader::at(data, 2);
    let removed_count = r.u16()?;
    let mut removed = Vec::with_capacity(removed_count as usize);
    for _ in 0..removed_count {
        removed.push(r.u16()?);
    }

    let added_count_pos = r.position();
    let added_count = r.u16()?;
    let mut added = Vec::with_capacity(added_count as usize);
    let mut duplicates: Vec<Range<usize>> = Vec::new();
    let mut self_seen = peer.initial_object_seen();

    for _ in 0..added_count {
        let start = r.position();
        let id = r.u16()?;
        let _kind = r.u8()?;
        let init_len = r.u32()? as usize;
        let init = r.bytes(init_len)?;
        let end = r.position();

        let is_self = username.is_some() && object_name(init) == username;
        if is_self {
            if self_seen {
                duplicates.push(start..end);
            } else {
                self_seen = true;
            }
            continue;
        }

        added.push(id);
    }

    if self_seen {
        peer.set_initial_object_seen();
    }
    peer.update_active_objects(&added, &removed);

    if duplicates.is_empty() {
        return Ok(data.to_vec());
    }

    let cut: usize = duplicates.iter().map(|range| range.len()).sum();
    let mut out = Vec::with_capacity(data.len() - cut);
    let mut cursor = 0;
    for range in &duplicates {
        out.extend_from_slice(&data[cursor..range.start]);
        cursor = range.end;
    }
    out.extend_from_slice(&data[cursor..]);

    let final_count = added_count - duplicates.len() as u16;
    out[added_count_pos..added_count_pos + 2].copy_from_slice(&final_count.to_be_bytes());

    Ok(out)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::connection::MemoryConnection;
    use shared::{to_client, Writer};
    use std::collections::HashSet;
    use std::sync::Arc;

    /// Builds a remove/add payload; each added object is (id, name)
    pub(crate) fn remove_add(removed: &[u16], added: &[(u16, &str)]) -> Vec<u8> {
        let mut w = Writer::with_opcode(to_client::ACTIVE_OBJECT_REMOVE_ADD);
        w.u16(removed.len() as u16);
        for id in removed {
            w.u16(*id);
        }

        w.u16(added.len() as u16);
        for (id, name) in added {
            let mut init = Writer::new();
            init.u8(1);
            init.string16(name.as_bytes()).unwrap();
            init.u8(1).bytes(&[0xAA; 6]);
            let init = init.finish();

            w.u16(*id).u8(101).u32(init.len() as u32).bytes(&init);
        }
        w.finish()
    }

    /// Returns (removed ids, added ids with names) as found on the wire
    pub(crate) fn parse(data: &[u8]) -> (Vec<u16>, Vec<(u16, String)>) {
        let mut r = Reader::at(data, 2);
        let removed = (0..r.u16().unwrap()).map(|_| r.u16().unwrap()).collect();
        let count = r.u16().unwrap();
        let mut added = Vec::new();
        for _ in 0..count {
            let id = r.u16().unwrap();
            r.u8().unwrap();
            let len = r.u32().unwrap() as usize;
            let init = r.bytes(len).unwrap();
            let name = String::from_utf8(object_name(init).unwrap().to_vec()).unwrap();
            added.push((id, name));
        }
        assert_eq!(r.remaining(), 0, "trailing bytes after last entry");
        (removed, added)
    }

    fn client_peer(name: Option<&str>) -> Peer {
        let (local, _remote) = MemoryConnection::pair(
            "127.0.0.1:40000".parse().unwrap(),
            "127.0.0.1:50000".parse().unwrap(),
        );
        let peer = Peer::new(1, Arc::new(local), false);
        if let Some(name) = name {
            peer.bind_username(name);
        }
        peer
    }

    fn ids(v: &[u16]) -> HashSet<u16> {
        v.iter().copied().collect()
    }

    #[test]
    fn test_generic_objects_are_tracked() {
        let peer = client_peer(Some("alice"));
        let data = remove_add(&[], &[(10, "bob"), (11, ""), (12, "carol")]);

        let out = remap_active_objects(&peer, &data).unwrap();

        assert_eq!(out, data);
        assert_eq!(peer.active_object_ids(), ids(&[10, 11, 12]));
        assert!(!peer.initial_object_seen());
    }

    #[test]
    fn test_first_self_entry_is_kept_but_not_tracked() {
        let peer = client_peer(Some("alice"));
        let data = remove_add(&[], &[(10, "bob"), (20, "alice")]);

        let out = remap_active_objects(&peer, &data).unwrap();

        assert_eq!(out, data);
        assert!(peer.initial_object_seen());
        assert_eq!(peer.active_object_ids(), ids(&[10]));
    }

    #[test]
    fn test_later_self_entry_is_spliced_out() {
        let peer = client_peer(Some("alice"));
        remap_active_objects(&peer, &remove_add(&[], &[(20, "alice")])).unwrap();

        let data = remove_add(&[3], &[(30, "bob"), (40, "alice"), (50, "carol")]);
        let out = remap_active_objects(&peer, &data).unwrap();

        let (removed, added) = parse(&out);
        assert_eq!(removed, vec![3]);
        assert_eq!(
            added,
            vec![(30, "bob".to_string()), (50, "carol".to_string())]
        );
        assert!(out.len() < data.len());
        assert!(peer.initial_object_seen());
        assert_eq!(peer.active_object_ids(), ids(&[30, 50]));
    }

    #[test]
    fn test_self_entry_last_in_packet() {
        let peer = client_peer(Some("alice"));
        peer.set_initial_object_seen();

        let data = remove_add(&[], &[(30, "bob"), (40, "alice")]);
        let (_, added) = parse(&remap_active_objects(&peer, &data).unwrap());
        assert_eq!(added, vec![(30, "bob".to_string())]);
    }

    #[test]
    fn test_multiple_duplicates_in_one_packet() {
        let peer = client_peer(Some("alice"));
        let data = remove_add(
            &[],
            &[(1, "alice"), (2, "bob"), (3, "alice"), (4, "alice")],
        );

        let out = remap_active_objects(&peer, &data).unwrap();

        let (_, added) = parse(&out);
        assert_eq!(
            added,
            vec![(1, "alice".to_string()), (2, "bob".to_string())]
        );
        assert_eq!(peer.active_object_ids(), ids(&[2]));
    }

    #[test]
    fn test_removals_clear_tracked_ids() {
        let peer = client_peer(Some("alice"));
        remap_active_objects(&peer, &remove_add(&[], &[(5, "a"), (6, "b")])).unwrap();
        remap_active_objects(&peer, &remove_add(&[5, 77], &[(7, "c")])).unwrap();

        assert_eq!(peer.active_object_ids(), ids(&[6, 7]));
    }

    #[test]
    fn test_zero_id_is_never_tracked() {
        let peer = client_peer(Some("alice"));
        remap_active_objects(&peer, &remove_add(&[], &[(0, "ghost"), (9, "x")])).unwrap();

        assert!(!peer.has_active_object(0));
        assert!(peer.has_active_object(9));
    }

    #[test]
    fn test_unbound_peer_never_matches_self() {
        let peer = client_peer(None);
        let data = remove_add(&[], &[(1, ""), (2, "alice")]);

        assert_eq!(remap_active_objects(&peer, &data).unwrap(), data);
        assert!(!peer.initial_object_seen());
        assert_eq!(peer.active_object_ids(), ids(&[1, 2]));
    }

    #[test]
    fn test_truncated_payload_is_rejected_without_side_effects() {
        let peer = client_peer(Some("alice"));
        let data = remove_add(&[1], &[(10, "alice"), (11, "bob")]);

        for len in [0, 2, 3, 5, 7, data.len() - 1] {
            assert!(
                remap_active_objects(&peer, &data[..len]).is_err(),
                "length {} accepted",
                len
            );
        }

        assert!(!peer.initial_object_seen());
        assert!(peer.active_object_ids().is_empty());
    }

    #[test]
    fn test_oversized_init_length_is_rejected() {
        let peer = client_peer(Some("alice"));
        let mut data = remove_add(&[], &[(10, "bob")]);
        // init length field of the only entry starts after opcode, counts, id and type
        data[9..13].copy_from_slice(&u32::MAX.to_be_bytes());

        assert!(matches!(
            remap_active_objects(&peer, &data),
            Err(WireError::Truncated { .. })
        ));
    }

    #[test]
    fn test_trailing_bytes_are_preserved() {
        let peer = client_peer(Some("alice"));
        peer.set_initial_object_seen();

        let mut data = remove_add(&[], &[(40, "alice"), (41, "bob")]);
        data.extend_from_slice(&[0xDE, 0xAD]);

        let out = remap_active_objects(&peer, &data).unwrap();
        assert_eq!(&out[out.len() - 2..], &[0xDE, 0xAD]);
    }
}
