//! The filter contract the Handler dispatches through.
//!
//! A filter has two halves:
//! - [`Filter::matches`]: a cheap, synchronous test that inspects request
//!   fields only. Returning `Some(args)` claims the request.
//! - [`Filter::handle`]: runs only for a claimed request. It either returns a
//!   response for the Handler to write, or hijacks the connection and
//!   returns `None`, in which case the Handler writes nothing further.
//!
//! The Handler consults filters in their configured order and the first
//! claim wins.

use super::conn::{ProxyRequest, ProxyResponse, ResponseSink};
use super::error::ProxyResult;
use super::handler::Handler;
use async_trait::async_trait;
use http::Extensions;

/// Filter-defined metadata carried from `matches` to `handle`.
///
/// Presence is the claim; the contents are private to the filter that
/// produced them.
#[derive(Debug, Default)]
pub struct FilterArgs {
    values: Extensions,
}

impl FilterArgs {
    /// An empty claim.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a typed value, returning any previous value of that type.
    pub fn insert<T: Clone + Send + Sync + 'static>(&mut self, value: T) -> Option<T> {
        self.values.insert(value)
    }

    /// Attach a typed value, builder style.
    pub fn with<T: Clone + Send + Sync + 'static>(mut self, value: T) -> Self {
        self.values.insert(value);
        self
    }

    /// Borrow a typed value.
    pub fn get<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.values.get::<T>()
    }

    /// Take a typed value out.
    pub fn remove<T: Send + Sync + 'static>(&mut self) -> Option<T> {
        self.values.remove::<T>()
    }

    /// Whether no values are attached.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// A unit of request processing in the Handler's pipeline.
#[async_trait]
pub trait Filter: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Decide whether this filter claims `req`.
    ///
    /// Must not perform I/O. An error aborts dispatch of this request.
    fn matches(&self, req: &ProxyRequest) -> ProxyResult<Option<FilterArgs>>;

    /// Process a claimed request.
    async fn handle(
        &self,
        handler: &Handler,
        args: FilterArgs,
        sink: &mut ResponseSink,
        req: ProxyRequest,
    ) -> ProxyResult<Option<ProxyResponse>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Upstream(String);

    #[test]
    fn test_filter_args_typed_values() {
        let mut args = FilterArgs::new().with(Upstream("a.example:443".into()));
        assert!(!args.is_empty());
        assert_eq!(
            args.get::<Upstream>(),
            Some(&Upstream("a.example:443".into()))
        );
        assert!(args.get::<u32>().is_none());

        let old = args.insert(Upstream("b.example:443".into()));
        assert_eq!(old, Some(Upstream("a.example:443".into())));
        assert_eq!(
            args.remove::<Upstream>(),
            Some(Upstream("b.example:443".into()))
        );
        assert!(args.is_empty());
    }
}
