//! Minimal MS-DTYP security descriptor support.
//!
//! GKDI authorises key release against a self-relative security descriptor
//! synthesised from the protection SID. Only the exact shape Windows puts on
//! the wire is produced here: owner and group `S-1-5-18`, no SACL, and a
//! two-entry DACL granting `0x3` to the protected SID and `0x2` to World.

use crate::error::{Error, Result};

/// SECURITY_DESCRIPTOR_CONTROL: SE_SELF_RELATIVE | SE_DACL_PRESENT.
const SD_CONTROL: u16 = 0x8000 | 0x0004;
const SD_HEADER_LEN: usize = 20;
const ACL_HEADER_LEN: usize = 8;
const ACE_HEADER_LEN: usize = 8;

/// Access mask granting unprotect rights to the protected SID.
pub const ACCESS_PROTECT: u32 = 0x3;
/// Access mask Windows stamps on the trailing World entry.
pub const ACCESS_WORLD: u32 = 0x2;

/// Encode an `S-1-...` SID string into its canonical binary form.
pub fn sid_to_bytes(sid: &str) -> Result<Vec<u8>> {
    let rest = sid
        .strip_prefix("S-1-")
        .ok_or(Error::invalid("sid prefix", 0))?;
    let mut parts = rest.split('-');
    let authority: u64 = parts
        .next()
        .and_then(|v| v.parse().ok())
        .ok_or(Error::invalid("sid authority", 0))?;
    let sub_authorities: Vec<u32> = parts
        .map(|v| v.parse().map_err(|_| Error::invalid("sid sub-authority", 0)))
        .collect::<Result<_>>()?;
    if sub_authorities.len() > 15 {
        return Err(Error::invalid("sid sub-authority count", 1));
    }

    let mut out = Vec::with_capacity(8 + 4 * sub_authorities.len());
    out.push(1); // revision
    out.push(sub_authorities.len() as u8);
    out.extend_from_slice(&authority.to_be_bytes()[2..]);
    for sub in &sub_authorities {
        out.extend_from_slice(&sub.to_le_bytes());
    }
    Ok(out)
}

fn sid_from_bytes(data: &[u8], offset: usize) -> Result<(String, usize)> {
    if data.len() < 8 || data[0] != 1 {
        return Err(Error::invalid("sid revision", offset));
    }
    let count = data[1] as usize;
    let len = 8 + 4 * count;
    if count > 15 || data.len() < len {
        return Err(Error::invalid("sid sub-authority count", offset + 1));
    }
    let mut authority_bytes = [0u8; 8];
    authority_bytes[2..].copy_from_slice(&data[2..8]);
    let authority = u64::from_be_bytes(authority_bytes);

    let mut sid = format!("S-1-{authority}");
    for i in 0..count {
        let start = 8 + 4 * i;
        let sub = u32::from_le_bytes(data[start..start + 4].try_into().expect("4-byte slice"));
        sid.push_str(&format!("-{sub}"));
    }
    Ok((sid, len))
}

/// Encode one ACCESS_ALLOWED_ACE for `sid` with the raw `access_mask`.
pub fn ace_to_bytes(sid: &str, access_mask: u32) -> Result<Vec<u8>> {
    let sid = sid_to_bytes(sid)?;
    let mut out = Vec::with_capacity(ACE_HEADER_LEN + sid.len());
    out.push(0); // ACCESS_ALLOWED_ACE_TYPE
    out.push(0); // no flags
    out.extend_from_slice(&((ACE_HEADER_LEN + sid.len()) as u16).to_le_bytes());
    out.extend_from_slice(&access_mask.to_le_bytes());
    out.extend_from_slice(&sid);
    Ok(out)
}

/// Build a self-relative security descriptor with the supplied DACL entries.
/// The DACL is laid out first, followed by the owner and group SIDs.
pub fn sd_to_bytes(owner: &str, group: &str, dacl: &[Vec<u8>]) -> Result<Vec<u8>> {
    let owner = sid_to_bytes(owner)?;
    let group = sid_to_bytes(group)?;

    let aces_len: usize = dacl.iter().map(Vec::len).sum();
    let mut acl = Vec::with_capacity(ACL_HEADER_LEN + aces_len);
    acl.push(2); // ACL_REVISION
    acl.push(0); // Sbz1
    acl.extend_from_slice(&((ACL_HEADER_LEN + aces_len) as u16).to_le_bytes());
    acl.extend_from_slice(&(dacl.len() as u16).to_le_bytes());
    acl.extend_from_slice(&[0, 0]); // Sbz2
    for ace in dacl {
        acl.extend_from_slice(ace);
    }

    let owner_offset = SD_HEADER_LEN + acl.len();
    let group_offset = owner_offset + owner.len();

    let mut out = Vec::with_capacity(group_offset + group.len());
    out.push(1); // revision
    out.push(0); // Sbz1
    out.extend_from_slice(&SD_CONTROL.to_le_bytes());
    out.extend_from_slice(&(owner_offset as u32).to_le_bytes());
    out.extend_from_slice(&(group_offset as u32).to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes()); // no SACL
    out.extend_from_slice(&(SD_HEADER_LEN as u32).to_le_bytes());
    out.extend_from_slice(&acl);
    out.extend_from_slice(&owner);
    out.extend_from_slice(&group);
    Ok(out)
}

/// The security descriptor GKDI keys are bound to for a protection SID.
///
/// Owner and group are SYSTEM; the wire always shows the protected SID with
/// mask `0x3` followed by World with mask `0x2`.
pub fn build_target_descriptor(sid: &str) -> Result<Vec<u8>> {
    sd_to_bytes(
        "S-1-5-18",
        "S-1-5-18",
        &[
            ace_to_bytes(sid, ACCESS_PROTECT)?,
            ace_to_bytes("S-1-1-0", ACCESS_WORLD)?,
        ],
    )
}

/// Recover the protected SID from a target descriptor: the grantee of the
/// first DACL entry.
pub fn protected_sid(sd: &[u8]) -> Result<String> {
    if sd.len() < SD_HEADER_LEN {
        return Err(Error::invalid("security descriptor header", 0));
    }
    let dacl_offset =
        u32::from_le_bytes(sd[16..20].try_into().expect("4-byte slice")) as usize;
    if dacl_offset == 0 || sd.len() < dacl_offset + ACL_HEADER_LEN {
        return Err(Error::invalid("dacl offset", 16));
    }
    let ace_count = u16::from_le_bytes(
        sd[dacl_offset + 4..dacl_offset + 6]
            .try_into()
            .expect("2-byte slice"),
    );
    if ace_count == 0 {
        return Err(Error::invalid("dacl ace count", dacl_offset + 4));
    }
    let ace_offset = dacl_offset + ACL_HEADER_LEN;
    if sd.len() < ace_offset + ACE_HEADER_LEN {
        return Err(Error::invalid("ace header", ace_offset));
    }
    let sid_offset = ace_offset + ACE_HEADER_LEN;
    let (sid, _) = sid_from_bytes(&sd[sid_offset..], sid_offset)?;
    Ok(sid)
}
