//! Registered object lists and message-id encoding.
//!
//! Members are encoded compactly: the first character is the member
//! type (`?` method, `!` signal, `@` property), a `&` after the type
//! char marks a sessionless signal, property names end with an access
//! marker (`<` write, `=` readwrite, `>` read), and method arguments
//! follow after a space. Interface names may start with `$` (secure)
//! or `#` (security off).
//!
//! A message id packs `(list, object, interface, member)` into a u32;
//! replies set the top bit of the list byte.

pub const SECURE_TRUE: u8 = b'$';
pub const SECURE_OFF: u8 = b'#';
pub const MEMBER_SIGNAL: u8 = b'!';
pub const MEMBER_METHOD: u8 = b'?';
pub const MEMBER_PROPERTY: u8 = b'@';
pub const SESSIONLESS: u8 = b'&';

/// Object carries secure members regardless of interface sentinels.
pub const OBJ_FLAG_SECURE: u8 = 0x01;
/// Object is registered but skipped by iteration.
pub const OBJ_FLAG_DISABLED: u8 = 0x02;

pub const STANDARD_LIST: usize = 0;
pub const APP_LIST: usize = 1;
pub const PROXY_LIST: usize = 2;
pub const NUM_OBJECT_LISTS: usize = 3;

const REPLY_ID_FLAG: u32 = 0x80 << 24;

pub fn encode_message_id(list: usize, obj: usize, iface: usize, member: usize) -> u32 {
    ((list as u32) << 24) | ((obj as u32) << 16) | ((iface as u32) << 8) | (member as u32)
}

pub fn reply_id(id: u32) -> u32 {
    id | REPLY_ID_FLAG
}

pub fn is_reply_id(id: u32) -> bool {
    id & REPLY_ID_FLAG != 0
}

// =============================================================================
// STANDARD MESSAGE IDS
// =============================================================================

pub const METHOD_EXCHANGE_GUIDS: u32 = encode_id(STANDARD_LIST, 0, 0, 0);
pub const METHOD_EXCHANGE_SUITES: u32 = encode_id(STANDARD_LIST, 0, 0, 1);
pub const METHOD_KEY_EXCHANGE: u32 = encode_id(STANDARD_LIST, 0, 0, 2);
pub const METHOD_KEY_AUTHENTICATION: u32 = encode_id(STANDARD_LIST, 0, 0, 3);
pub const METHOD_GEN_SESSION_KEY: u32 = encode_id(STANDARD_LIST, 0, 0, 4);
pub const METHOD_EXCHANGE_GROUP_KEYS: u32 = encode_id(STANDARD_LIST, 0, 0, 5);
pub const METHOD_SEND_MANIFEST: u32 = encode_id(STANDARD_LIST, 0, 0, 6);
pub const METHOD_SEND_MEMBERSHIPS: u32 = encode_id(STANDARD_LIST, 0, 0, 7);

pub const METHOD_SECURITY_GET_PROP: u32 = encode_id(STANDARD_LIST, 1, 0, 0);
pub const PROPERTY_SEC_ECC_PUBLICKEY: u32 = encode_id(STANDARD_LIST, 1, 0, 1);
pub const PROPERTY_SEC_MANIFEST_TEMPLATE: u32 = encode_id(STANDARD_LIST, 1, 0, 2);
pub const METHOD_CLAIM: u32 = encode_id(STANDARD_LIST, 1, 0, 3);

const fn encode_id(list: usize, obj: usize, iface: usize, member: usize) -> u32 {
    ((list as u32) << 24) | ((obj as u32) << 16) | ((iface as u32) << 8) | (member as u32)
}

// =============================================================================
// OBJECT MODEL
// =============================================================================

#[derive(Debug, Clone)]
pub struct Interface {
    /// Interface name, optionally prefixed with `$` or `#`.
    pub name: String,
    /// Encoded members, in declaration order.
    pub members: Vec<String>,
}

impl Interface {
    pub fn new(name: &str, members: &[&str]) -> Interface {
        Interface {
            name: name.to_string(),
            members: members.iter().map(|m| m.to_string()).collect(),
        }
    }

    /// Interface name with any security sentinel stripped.
    pub fn bare_name(&self) -> &str {
        let bytes = self.name.as_bytes();
        if !bytes.is_empty() && (bytes[0] == SECURE_TRUE || bytes[0] == SECURE_OFF) {
            &self.name[1..]
        } else {
            &self.name
        }
    }

    pub fn is_secure(&self) -> bool {
        self.name.as_bytes().first() == Some(&SECURE_TRUE)
    }
}

#[derive(Debug, Clone)]
pub struct Object {
    pub path: String,
    pub flags: u8,
    pub interfaces: Vec<Interface>,
}

impl Object {
    pub fn new(path: &str, flags: u8, interfaces: Vec<Interface>) -> Object {
        Object { path: path.to_string(), flags, interfaces }
    }
}

/// Member type, indexing the per-class access direction tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberKind {
    Signal = 0,
    Method = 1,
    Property = 2,
}

/// Member type from the encoding's first character.
pub fn member_kind(encoding: &str) -> Option<MemberKind> {
    match encoding.as_bytes().first() {
        Some(&MEMBER_SIGNAL) => Some(MemberKind::Signal),
        Some(&MEMBER_METHOD) => Some(MemberKind::Method),
        Some(&MEMBER_PROPERTY) => Some(MemberKind::Property),
        _ => None,
    }
}

/// Member encoding with the type char and sessionless marker stripped.
/// Trailing argument text and property access markers remain part of
/// the encoding; rule matching stops only at a space, so rules that
/// target properties carry a trailing `*` or the whole encoded name.
pub fn member_body(encoding: &str) -> &str {
    let mut rest = encoding;
    if member_kind(rest).is_some() {
        rest = &rest[1..];
    }
    if rest.as_bytes().first() == Some(&SESSIONLESS) {
        rest = &rest[1..];
    }
    rest
}

// =============================================================================
// OBJECT LISTS
// =============================================================================

/// The registered object lists: standard bus objects, application
/// objects, proxy objects. Built once at startup.
pub struct ObjectLists {
    lists: [Vec<Object>; NUM_OBJECT_LISTS],
}

impl Default for ObjectLists {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectLists {
    pub fn new() -> ObjectLists {
        ObjectLists { lists: [standard_objects(), Vec::new(), Vec::new()] }
    }

    pub fn register(&mut self, app: Vec<Object>, proxy: Vec<Object>) {
        self.lists[APP_LIST] = app;
        self.lists[PROXY_LIST] = proxy;
    }

    pub fn object(&self, list: usize, obj: usize) -> Option<&Object> {
        self.lists.get(list)?.get(obj)
    }

    /// Visit every member of every enabled object, in registration
    /// order, with its packed message id.
    pub fn for_each_member<F>(&self, mut f: F)
    where
        F: FnMut(u32, &Object, &Interface, &str),
    {
        for (l, list) in self.lists.iter().enumerate() {
            for (o, obj) in list.iter().enumerate() {
                if obj.flags & OBJ_FLAG_DISABLED != 0 {
                    continue;
                }
                for (i, iface) in obj.interfaces.iter().enumerate() {
                    for (m, member) in iface.members.iter().enumerate() {
                        f(encode_message_id(l, o, i, m), obj, iface, member);
                    }
                }
            }
        }
    }
}

fn standard_objects() -> Vec<Object> {
    vec![
        Object::new(
            "/org/thinbus/Bus/Peer",
            0,
            vec![Interface::new(
                "org.thinbus.Bus.Peer.Authentication",
                &[
                    "?ExchangeGuids <su >su",
                    "?ExchangeSuites <au >au",
                    "?KeyExchange",
                    "?KeyAuthentication",
                    "?GenSessionKey <sss >ss",
                    "?ExchangeGroupKeys <ay >ay",
                    "?SendManifest",
                    "?SendMemberships",
                ],
            )],
        ),
        Object::new(
            "/org/thinbus/Security",
            OBJ_FLAG_SECURE,
            vec![Interface::new(
                "$org.thinbus.Security",
                &[
                    "?Get <s >v",
                    "@ECCPublicKey>",
                    "@ManifestTemplate>",
                    "?Claim <a(yay) >b",
                ],
            )],
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_packing() {
        let id = encode_message_id(1, 2, 3, 4);
        assert_eq!(id, 0x0102_0304);
        assert!(is_reply_id(reply_id(id)));
        assert!(!is_reply_id(id));
    }

    #[test]
    fn member_encoding_parses() {
        assert_eq!(member_kind("?Claim <a(yay) >b"), Some(MemberKind::Method));
        assert_eq!(member_kind("@ECCPublicKey>"), Some(MemberKind::Property));
        assert_eq!(member_kind("!&Dropped >u"), Some(MemberKind::Signal));
        assert_eq!(member_body("!&Dropped >u"), "Dropped >u");
        assert_eq!(member_body("@ECCPublicKey>"), "ECCPublicKey>");
    }

    #[test]
    fn secure_sentinel() {
        let iface = Interface::new("$org.thinbus.Security", &[]);
        assert!(iface.is_secure());
        assert_eq!(iface.bare_name(), "org.thinbus.Security");

        let off = Interface::new("#org.thinbus.Debug", &[]);
        assert!(!off.is_secure());
        assert_eq!(off.bare_name(), "org.thinbus.Debug");
    }

    #[test]
    fn standard_ids_line_up() {
        let lists = ObjectLists::new();
        let mut found = Vec::new();
        lists.for_each_member(|id, _, _, _| found.push(id));
        assert!(found.contains(&METHOD_EXCHANGE_GUIDS));
        assert!(found.contains(&METHOD_SEND_MEMBERSHIPS));
        assert!(found.contains(&METHOD_CLAIM));
    }
}
