//! # Event Bus
//!
//! Named extension points fired during routing and the page lifecycle.
//! Every event is halting: listeners run in priority order and the first
//! one returning `Some` wins, short-circuiting the default behaviour.

use crate::object::CompoundObject;
use crate::types::CmsResponse;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// An event and the data its listeners may inspect.
#[derive(Debug)]
pub enum CmsEvent<'a> {
    /// Before the router matches a URL. `Page` replaces the routing result.
    BeforeRoute { url: &'a str },
    /// After routing, before the page runs. `Page` swaps the page,
    /// `Response` or `Content` replace the whole response.
    BeforeDisplay {
        url: &'a str,
        page: Option<&'a CompoundObject>,
    },
    /// After code objects and components are initialised.
    PageInit { page: &'a CompoundObject },
    /// Before the page cycle starts.
    PageStart { page: &'a CompoundObject },
    /// After the page cycle ends.
    PageEnd { page: &'a CompoundObject },
    /// Once layout and page components are in place. Not halting in effect.
    InitComponents {
        page: &'a CompoundObject,
        layout: &'a CompoundObject,
    },
    /// Before page markup is rendered. `Content` replaces the page contents.
    BeforeRenderPage { page: &'a CompoundObject },
    /// Final HTML about to be sent. `Content` replaces it.
    Display { url: &'a str, content: &'a str },
    /// Before a component's `on_run`. Any result stops the component run.
    ComponentBeforeRun { alias: &'a str },
    /// After a component's `on_run`.
    ComponentRun { alias: &'a str },
    /// Before a partial is loaded. `Content` replaces the partial output.
    BeforeRenderPartial { name: &'a str },
    /// After a partial is rendered. `Content` replaces its output.
    RenderPartial { name: &'a str, content: &'a str },
    /// Postprocess hook over the final HTML. `Content` replaces it.
    PostProcess { url: &'a str, content: &'a str },
}

impl CmsEvent<'_> {
    /// Dotted event name listeners subscribe to.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::BeforeRoute { .. } => "cms.router.beforeRoute",
            Self::BeforeDisplay { .. } => "cms.page.beforeDisplay",
            Self::PageInit { .. } => "cms.page.init",
            Self::PageStart { .. } => "cms.page.start",
            Self::PageEnd { .. } => "cms.page.end",
            Self::InitComponents { .. } => "cms.page.initComponents",
            Self::BeforeRenderPage { .. } => "cms.page.beforeRenderPage",
            Self::Display { .. } => "cms.page.display",
            Self::ComponentBeforeRun { .. } => "cms.component.beforeRun",
            Self::ComponentRun { .. } => "cms.component.run",
            Self::BeforeRenderPartial { .. } => "cms.page.beforeRenderPartial",
            Self::RenderPartial { .. } => "cms.page.renderPartial",
            Self::PostProcess { .. } => "cms.page.postprocess",
        }
    }
}

/// What a listener answered with.
#[derive(Debug, Clone, PartialEq)]
pub enum EventResult {
    /// A complete response.
    Response(CmsResponse),
    /// The file name of a page to use instead.
    Page(String),
    /// Replacement markup or text.
    Content(String),
    /// Truthy with no payload.
    Halt,
}

type Listener = Arc<dyn Fn(&CmsEvent<'_>) -> Option<EventResult> + Send + Sync>;

/// Registry of event listeners.
#[derive(Default, Clone)]
pub struct EventBus {
    listeners: HashMap<&'static str, Vec<(i32, Listener)>>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut counts: Vec<_> = self
            .listeners
            .iter()
            .map(|(name, list)| (*name, list.len()))
            .collect();
        counts.sort_unstable();
        f.debug_struct("EventBus").field("listeners", &counts).finish()
    }
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe with priority 0.
    pub fn listen<F>(&mut self, event: &'static str, listener: F)
    where
        F: Fn(&CmsEvent<'_>) -> Option<EventResult> + Send + Sync + 'static,
    {
        self.listen_with_priority(event, 0, listener);
    }

    /// Subscribe; higher priorities run first, ties in subscription order.
    pub fn listen_with_priority<F>(&mut self, event: &'static str, priority: i32, listener: F)
    where
        F: Fn(&CmsEvent<'_>) -> Option<EventResult> + Send + Sync + 'static,
    {
        let list = self.listeners.entry(event).or_default();
        let at = list
            .iter()
            .position(|(p, _)| *p < priority)
            .unwrap_or(list.len());
        list.insert(at, (priority, Arc::new(listener)));
    }

    #[must_use]
    pub fn has_listeners(&self, event: &str) -> bool {
        self.listeners.get(event).is_some_and(|l| !l.is_empty())
    }

    /// Fire an event; the first `Some` answer wins.
    pub fn fire(&self, event: &CmsEvent<'_>) -> Option<EventResult> {
        let listeners = self.listeners.get(event.name())?;
        let result = listeners.iter().find_map(|(_, listener)| listener(event));
        if result.is_some() {
            tracing::debug!(event = event.name(), "event halted by listener");
        }
        result
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_answer_wins() {
        let mut bus = EventBus::new();
        bus.listen("cms.router.beforeRoute", |_| None);
        bus.listen("cms.router.beforeRoute", |_| {
            Some(EventResult::Page("a.htm".into()))
        });
        bus.listen("cms.router.beforeRoute", |_| {
            Some(EventResult::Page("b.htm".into()))
        });

        let result = bus.fire(&CmsEvent::BeforeRoute { url: "/" });
        assert_eq!(result, Some(EventResult::Page("a.htm".into())));
    }

    #[test]
    fn priority_orders_listeners() {
        let mut bus = EventBus::new();
        bus.listen("cms.page.display", |_| Some(EventResult::Content("low".into())));
        bus.listen_with_priority("cms.page.display", 10, |_| {
            Some(EventResult::Content("high".into()))
        });

        let result = bus.fire(&CmsEvent::Display {
            url: "/",
            content: "",
        });
        assert_eq!(result, Some(EventResult::Content("high".into())));
    }

    #[test]
    fn listeners_see_payload() {
        let mut bus = EventBus::new();
        bus.listen("cms.component.run", |event| match event {
            CmsEvent::ComponentRun { alias } if *alias == "stop" => Some(EventResult::Halt),
            _ => None,
        });

        assert!(bus.fire(&CmsEvent::ComponentRun { alias: "go" }).is_none());
        assert_eq!(
            bus.fire(&CmsEvent::ComponentRun { alias: "stop" }),
            Some(EventResult::Halt)
        );
        assert!(!bus.has_listeners("cms.page.end"));
    }
}
