//! # october-core
//!
//! The template resolution and page rendering engine for October themes.
//!
//! A request flows through three layers:
//! - `router` maps the URL to a page and extracts parameters, backed by a
//!   baked manifest, a cached rule table and a per-URL memo
//! - `object` parses pages, layouts and partials into settings, code and
//!   markup, relocating component declarations
//! - `controller` runs the page lifecycle: components, code hooks, AJAX
//!   and postback handlers, then page, layout and partial rendering
//!
//! ## Architectural Constraints
//!
//! - Synchronous: one request runs start to finish on one thread
//! - No network dependencies; the only shared state is the `Site`
//!   services and the external cache behind `CmsCache`
//! - Host code (page code sections, components, plugins, event
//!   listeners) is registered explicitly at startup

// =============================================================================
// MODULES
// =============================================================================

pub mod cache;
pub mod code;
pub mod component;
pub mod config;
pub mod controller;
pub mod event;
pub mod formats;
pub mod ini;
pub mod object;
pub mod primitives;
pub mod router;
pub mod site;
pub mod storage;
pub mod template;
pub mod theme;
pub mod types;

// =============================================================================
// RE-EXPORTS: Core Types (from types module)
// =============================================================================

pub use types::{
    CmsError, CmsRequest, CmsResponse, ErrorPhase, HandlerResult, ObjectKind, ObjectRef,
    ResponseBody, RouteParams, SessionData,
};

// =============================================================================
// RE-EXPORTS: Engine
// =============================================================================

pub use cache::{CacheStore, CmsCache, MemoryStore};
pub use code::{CodeRegistry, EmptyCode, PageCode, PageContext};
pub use component::{
    Component, ComponentContext, ComponentDetails, ComponentFactory, ComponentInstance,
    ComponentManager, Plugin, PropertyDefinition, ViewBag,
};
pub use config::{CacheBackend, CmsConfig};
pub use controller::Controller;
pub use event::{CmsEvent, EventBus, EventResult};
pub use object::CompoundObject;
pub use router::{RouteRule, Router, RouterOptions};
pub use site::Site;
pub use storage::RedbStore;
pub use template::{MarkupEngine, RenderHost, SecurityPolicy};
pub use theme::{Datasource, FileDatasource, MemoryDatasource, Theme, ThemeConfig};

// =============================================================================
// RE-EXPORTS: Formats (from formats module)
// =============================================================================

pub use formats::{ManifestEntry, ManifestHeader, manifest_from_bytes, manifest_to_bytes};
