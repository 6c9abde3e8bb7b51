// Peer identity: every field is independently present or absent
use crate::types::{GroupId, ProcessId, UserId};
use std::fmt;

/// The individual facts a [`Credentials`] value may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CredentialKind {
    ProcessId,
    UnixUserId,
    UnixGroupIds,
    WindowsSid,
    LinuxSecurityLabel,
    AuditData,
}

impl CredentialKind {
    pub const ALL: [CredentialKind; 6] = [
        CredentialKind::ProcessId,
        CredentialKind::UnixUserId,
        CredentialKind::UnixGroupIds,
        CredentialKind::WindowsSid,
        CredentialKind::LinuxSecurityLabel,
        CredentialKind::AuditData,
    ];
}

/// What is known about a process on the other end of a socket (or about us).
///
/// A partially populated value is normal: UNIX peers never carry a Windows SID,
/// TCP peers usually carry nothing at all.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pid: Option<ProcessId>,
    uid: Option<UserId>,
    gids: Option<Vec<GroupId>>,
    windows_sid: Option<String>,
    linux_security_label: Option<String>,
    audit_data: Option<Vec<u8>>,
}

impl Credentials {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the calling process: process id and effective uid.
    pub fn from_current_process() -> Self {
        let mut creds = Credentials::new();
        creds.add_pid(ProcessId(nix::unistd::getpid().as_raw() as u32));
        creds.add_unix_uid(UserId(nix::unistd::geteuid().as_raw()));
        creds
    }

    pub fn add_pid(&mut self, pid: ProcessId) {
        self.pid = Some(pid);
    }

    pub fn add_unix_uid(&mut self, uid: UserId) {
        self.uid = Some(uid);
    }

    /// Stores the group list sorted and without duplicates.
    pub fn add_unix_gids(&mut self, gids: impl IntoIterator<Item = GroupId>) {
        let mut gids: Vec<GroupId> = gids.into_iter().collect();
        gids.sort_unstable();
        gids.dedup();
        self.gids = Some(gids);
    }

    pub fn add_windows_sid(&mut self, sid: impl Into<String>) {
        self.windows_sid = Some(sid.into());
    }

    pub fn add_linux_security_label(&mut self, label: impl Into<String>) {
        self.linux_security_label = Some(label.into());
    }

    pub fn add_audit_data(&mut self, data: impl Into<Vec<u8>>) {
        self.audit_data = Some(data.into());
    }

    pub fn pid(&self) -> Option<ProcessId> {
        self.pid
    }

    pub fn unix_uid(&self) -> Option<UserId> {
        self.uid
    }

    pub fn unix_gids(&self) -> Option<&[GroupId]> {
        self.gids.as_deref()
    }

    pub fn windows_sid(&self) -> Option<&str> {
        self.windows_sid.as_deref()
    }

    pub fn linux_security_label(&self) -> Option<&str> {
        self.linux_security_label.as_deref()
    }

    pub fn audit_data(&self) -> Option<&[u8]> {
        self.audit_data.as_deref()
    }

    pub fn include(&self, kind: CredentialKind) -> bool {
        match kind {
            CredentialKind::ProcessId => self.pid.is_some(),
            CredentialKind::UnixUserId => self.uid.is_some(),
            CredentialKind::UnixGroupIds => self.gids.is_some(),
            CredentialKind::WindowsSid => self.windows_sid.is_some(),
            CredentialKind::LinuxSecurityLabel => self.linux_security_label.is_some(),
            CredentialKind::AuditData => self.audit_data.is_some(),
        }
    }

    pub fn clear(&mut self) {
        *self = Credentials::default();
    }

    /// Copies one kind from `other`. A kind `other` does not carry is skipped
    /// without complaint; several callers merge partially populated values.
    pub fn add_credential(&mut self, kind: CredentialKind, other: &Credentials) {
        match kind {
            CredentialKind::ProcessId => {
                if let Some(pid) = other.pid {
                    self.pid = Some(pid);
                }
            }
            CredentialKind::UnixUserId => {
                if let Some(uid) = other.uid {
                    self.uid = Some(uid);
                }
            }
            CredentialKind::UnixGroupIds => {
                if let Some(gids) = &other.gids {
                    self.gids = Some(gids.clone());
                }
            }
            CredentialKind::WindowsSid => {
                if let Some(sid) = &other.windows_sid {
                    self.windows_sid = Some(sid.clone());
                }
            }
            CredentialKind::LinuxSecurityLabel => {
                if let Some(label) = &other.linux_security_label {
                    self.linux_security_label = Some(label.clone());
                }
            }
            CredentialKind::AuditData => {
                if let Some(data) = &other.audit_data {
                    self.audit_data = Some(data.clone());
                }
            }
        }
    }

    /// Copies every field present in `other`; fields absent there stay as they are.
    pub fn merge_from(&mut self, other: &Credentials) {
        for kind in CredentialKind::ALL {
            self.add_credential(kind, other);
        }
    }

    /// True when every field present in `subset` is present here with an equal value.
    pub fn is_superset_of(&self, subset: &Credentials) -> bool {
        fn covers<T: PartialEq + ?Sized>(ours: Option<&T>, theirs: Option<&T>) -> bool {
            match theirs {
                None => true,
                Some(theirs) => ours == Some(theirs),
            }
        }

        // gids are stored sorted and de-duplicated, so slice equality is set equality
        covers(self.pid.as_ref(), subset.pid.as_ref())
            && covers(self.uid.as_ref(), subset.uid.as_ref())
            && covers(self.unix_gids(), subset.unix_gids())
            && covers(self.windows_sid(), subset.windows_sid())
            && covers(self.linux_security_label(), subset.linux_security_label())
            && covers(self.audit_data(), subset.audit_data())
    }

    pub fn is_empty(&self) -> bool {
        CredentialKind::ALL.iter().all(|kind| !self.include(*kind))
    }

    /// Neither a unix uid nor a Windows SID is known.
    pub fn is_anonymous(&self) -> bool {
        self.uid.is_none() && self.windows_sid.is_none()
    }

    /// Same unix uid, and either both sides carry the same Windows SID or neither carries one.
    pub fn same_user_as(&self, other: &Credentials) -> bool {
        self.uid == other.uid && self.windows_sid == other.windows_sid
    }

    pub fn to_display_string(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut parts: Vec<String> = Vec::new();
        if let Some(uid) = self.uid {
            parts.push(format!("uid={uid}"));
        }
        if let Some(gids) = &self.gids {
            let list: Vec<String> = gids.iter().map(|g| g.to_string()).collect();
            parts.push(format!("gids=[{}]", list.join(",")));
        }
        if let Some(pid) = self.pid {
            parts.push(format!("pid={pid}"));
        }
        if let Some(sid) = &self.windows_sid {
            parts.push(format!("sid={sid}"));
        }
        if let Some(label) = &self.linux_security_label {
            parts.push(format!("label={label}"));
        }
        if let Some(data) = &self.audit_data {
            parts.push(format!("audit={}", hex::encode(data)));
        }
        if parts.is_empty() {
            f.write_str("(empty credentials)")
        } else {
            f.write_str(&parts.join(" "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn uid_only(uid: u32) -> Credentials {
        let mut c = Credentials::new();
        c.add_unix_uid(UserId(uid));
        c
    }

    fn arb_credentials() -> impl Strategy<Value = Credentials> {
        (
            proptest::option::of(0u32..4),
            proptest::option::of(0u32..4),
            proptest::option::of(proptest::collection::vec(0u32..4, 0..4)),
            proptest::option::of(prop_oneof![Just("S-1-5-18"), Just("S-1-5-21")]),
            proptest::option::of(prop_oneof![Just("unconfined"), Just("system_u")]),
            proptest::option::of(proptest::collection::vec(any::<u8>(), 0..2)),
        )
            .prop_map(|(pid, uid, gids, sid, label, audit)| {
                let mut c = Credentials::new();
                if let Some(pid) = pid {
                    c.add_pid(ProcessId(pid));
                }
                if let Some(uid) = uid {
                    c.add_unix_uid(UserId(uid));
                }
                if let Some(gids) = gids {
                    c.add_unix_gids(gids.into_iter().map(GroupId));
                }
                if let Some(sid) = sid {
                    c.add_windows_sid(sid);
                }
                if let Some(label) = label {
                    c.add_linux_security_label(label);
                }
                if let Some(audit) = audit {
                    c.add_audit_data(audit);
                }
                c
            })
    }

    #[test]
    fn empty_credentials_are_anonymous() {
        let c = Credentials::new();
        assert!(c.is_empty());
        assert!(c.is_anonymous());
        assert_eq!(c.to_string(), "(empty credentials)");
        for kind in CredentialKind::ALL {
            assert!(!c.include(kind));
        }
    }

    #[test]
    fn pid_alone_is_still_anonymous() {
        let mut c = Credentials::new();
        c.add_pid(ProcessId(42));
        assert!(!c.is_empty());
        assert!(c.is_anonymous());
    }

    #[test]
    fn gids_are_sorted_and_deduplicated() {
        let mut c = Credentials::new();
        c.add_unix_gids([GroupId(9), GroupId(3), GroupId(9), GroupId(1)]);
        assert_eq!(c.unix_gids(), Some(&[GroupId(1), GroupId(3), GroupId(9)][..]));
    }

    #[test]
    fn add_credential_ignores_missing_kind() {
        let mut c = uid_only(7);
        c.add_credential(CredentialKind::ProcessId, &Credentials::new());
        assert_eq!(c.pid(), None);
        assert_eq!(c.unix_uid(), Some(UserId(7)));
    }

    #[test]
    fn merge_never_downgrades_present_fields() {
        let mut a = uid_only(7);
        a.add_linux_security_label("unconfined");
        let mut b = Credentials::new();
        b.add_pid(ProcessId(100));
        a.merge_from(&b);
        assert_eq!(a.unix_uid(), Some(UserId(7)));
        assert_eq!(a.pid(), Some(ProcessId(100)));
        assert_eq!(a.linux_security_label(), Some("unconfined"));
    }

    #[test]
    fn same_user_requires_matching_sid_presence() {
        let a = uid_only(1000);
        let mut b = uid_only(1000);
        assert!(a.same_user_as(&b));
        b.add_windows_sid("S-1-5-21");
        assert!(!a.same_user_as(&b));
        assert!(!b.same_user_as(&a));
        let mut c = uid_only(1000);
        c.add_windows_sid("S-1-5-21");
        assert!(b.same_user_as(&c));
        assert!(!uid_only(1000).same_user_as(&uid_only(0)));
    }

    #[test]
    fn display_is_deterministic() {
        let mut c = uid_only(1000);
        c.add_pid(ProcessId(5));
        c.add_unix_gids([GroupId(20), GroupId(10)]);
        assert_eq!(c.to_display_string(), "uid=1000 gids=[10,20] pid=5");
    }

    #[test]
    fn current_process_has_pid_and_uid() {
        let c = Credentials::from_current_process();
        assert!(c.include(CredentialKind::ProcessId));
        assert!(c.include(CredentialKind::UnixUserId));
        assert!(!c.is_anonymous());
    }

    proptest! {
        #[test]
        fn superset_is_reflexive(a in arb_credentials()) {
            prop_assert!(a.is_superset_of(&a));
        }

        #[test]
        fn superset_is_transitive(a in arb_credentials(), b in arb_credentials(), c in arb_credentials()) {
            if a.is_superset_of(&b) && b.is_superset_of(&c) {
                prop_assert!(a.is_superset_of(&c));
            }
        }

        #[test]
        fn merge_result_covers_other_and_keeps_own_kinds(a in arb_credentials(), b in arb_credentials()) {
            let mut merged = a.clone();
            merged.merge_from(&b);
            prop_assert!(merged.is_superset_of(&b));
            for kind in CredentialKind::ALL {
                if a.include(kind) {
                    prop_assert!(merged.include(kind));
                }
            }
        }

        #[test]
        fn everything_is_superset_of_empty(a in arb_credentials()) {
            prop_assert!(a.is_superset_of(&Credentials::new()));
        }
    }
}
