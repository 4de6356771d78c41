//! Deduplicated, order-stable subject sets
//!
//! Access reviews answer with bare user and group names. Service account
//! users (`system:serviceaccount:<ns>:<name>`) are split out so bindings
//! reference them with the ServiceAccount subject kind.

use k8s_openapi::api::rbac::v1::Subject;

use dbaas_common::crd::Authz;

const RBAC_API_GROUP: &str = "rbac.authorization.k8s.io";
const SERVICE_ACCOUNT_PREFIX: &str = "system:serviceaccount:";

/// RBAC subject kinds
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SubjectKind {
    /// A user name
    User,
    /// A group name
    Group,
    /// A namespaced service account
    ServiceAccount,
}

impl SubjectKind {
    fn as_str(&self) -> &'static str {
        match self {
            Self::User => "User",
            Self::Group => "Group",
            Self::ServiceAccount => "ServiceAccount",
        }
    }
}

/// One kind-qualified subject
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AccessSubject {
    /// Subject kind
    pub kind: SubjectKind,
    /// User, group or service account name
    pub name: String,
    /// Namespace, for service accounts only
    pub namespace: Option<String>,
}

impl AccessSubject {
    /// Subject for a user name, splitting out service accounts
    pub fn user(name: &str) -> Self {
        if let Some((namespace, sa)) = name
            .strip_prefix(SERVICE_ACCOUNT_PREFIX)
            .and_then(|rest| rest.split_once(':'))
        {
            if !namespace.is_empty() && !sa.is_empty() {
                return Self {
                    kind: SubjectKind::ServiceAccount,
                    name: sa.to_string(),
                    namespace: Some(namespace.to_string()),
                };
            }
        }
        Self {
            kind: SubjectKind::User,
            name: name.to_string(),
            namespace: None,
        }
    }

    /// Subject for a group name
    pub fn group(name: &str) -> Self {
        Self {
            kind: SubjectKind::Group,
            name: name.to_string(),
            namespace: None,
        }
    }

    /// RBAC binding subject
    pub fn to_rbac(&self) -> Subject {
        let api_group = match self.kind {
            SubjectKind::ServiceAccount => None,
            SubjectKind::User | SubjectKind::Group => Some(RBAC_API_GROUP.to_string()),
        };
        Subject {
            kind: self.kind.as_str().to_string(),
            name: self.name.clone(),
            namespace: self.namespace.clone(),
            api_group,
        }
    }
}

/// Ordered set of subjects. Insertion order is kept and duplicates dropped.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AccessSubjectSet {
    subjects: Vec<AccessSubject>,
}

impl AccessSubjectSet {
    /// Empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Set from an access review answer: users first, then groups
    pub fn from_review<U, G>(users: U, groups: G) -> Self
    where
        U: IntoIterator,
        U::Item: AsRef<str>,
        G: IntoIterator,
        G::Item: AsRef<str>,
    {
        let mut set = Self::new();
        for user in users {
            set.insert(AccessSubject::user(user.as_ref()));
        }
        for group in groups {
            set.insert(AccessSubject::group(group.as_ref()));
        }
        set
    }

    /// Set of the users and groups declared on a resource
    pub fn from_authz(authz: &Authz) -> Self {
        Self::from_review(&authz.users, &authz.groups)
    }

    /// Add a subject unless already present. Returns true if added.
    pub fn insert(&mut self, subject: AccessSubject) -> bool {
        if self.contains(&subject) {
            return false;
        }
        self.subjects.push(subject);
        true
    }

    /// True if the subject is in the set
    pub fn contains(&self, subject: &AccessSubject) -> bool {
        self.subjects.contains(subject)
    }

    /// Subjects of `self`, then those of `other` not already present
    pub fn union(&self, other: &Self) -> Self {
        let mut out = self.clone();
        for subject in &other.subjects {
            out.insert(subject.clone());
        }
        out
    }

    /// Subjects of `self` also in `other`, in `self`'s order
    pub fn intersection(&self, other: &Self) -> Self {
        Self {
            subjects: self
                .subjects
                .iter()
                .filter(|s| other.contains(s))
                .cloned()
                .collect(),
        }
    }

    /// Subjects of `self` not in `other`, in `self`'s order
    pub fn difference(&self, other: &Self) -> Self {
        Self {
            subjects: self
                .subjects
                .iter()
                .filter(|s| !other.contains(s))
                .cloned()
                .collect(),
        }
    }

    /// Number of subjects
    pub fn len(&self) -> usize {
        self.subjects.len()
    }

    /// True if the set has no subjects
    pub fn is_empty(&self) -> bool {
        self.subjects.is_empty()
    }

    /// Iterate in order
    pub fn iter(&self) -> impl Iterator<Item = &AccessSubject> {
        self.subjects.iter()
    }

    /// RBAC binding subjects, in order
    pub fn to_rbac_subjects(&self) -> Vec<Subject> {
        self.subjects.iter().map(AccessSubject::to_rbac).collect()
    }
}

impl FromIterator<AccessSubject> for AccessSubjectSet {
    fn from_iter<I: IntoIterator<Item = AccessSubject>>(iter: I) -> Self {
        let mut set = Self::new();
        for subject in iter {
            set.insert(subject);
        }
        set
    }
}
