use dmirror_replicate::Key;
use dmirror_rpc::ResourceKind;

/// A mirror or unmirror request, resolved to what it addresses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceRequest {
    Base(Key),
    Drive(Key),
}

impl ResourceRequest {
    /// An unspecified kind means [`ResourceKind::Base`].
    pub fn new(key: Key, kind: Option<ResourceKind>) -> Self {
        match kind.unwrap_or_default() {
            ResourceKind::Base => Self::Base(key),
            ResourceKind::Drive => Self::Drive(key),
        }
    }

    pub fn key(&self) -> &Key {
        match self {
            Self::Base(key) | Self::Drive(key) => key,
        }
    }

    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::Base(_) => ResourceKind::Base,
            Self::Drive(_) => ResourceKind::Drive,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(None, ResourceKind::Base)]
    #[case(Some(ResourceKind::Base), ResourceKind::Base)]
    #[case(Some(ResourceKind::Drive), ResourceKind::Drive)]
    fn test_resolves_kind(#[case] kind: Option<ResourceKind>, #[case] expected: ResourceKind) {
        let key = Key::from_bytes([7; 32]);
        let request = ResourceRequest::new(key, kind);
        assert_eq!(request.kind(), expected);
        assert_eq!(*request.key(), key);
    }
}
