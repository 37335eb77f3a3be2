// tunecache engine
//
// Local media cache and desktop-lyrics broadcast for the desktop player:
//   - remote tracks fetched from mirror lists into a content-addressed cache
//   - user-imported files registered and copied into the same cache on demand
//   - one loopback HTTP origin serving the cache plus a lyrics event stream
//   - supervision of the external on-screen lyrics helper

pub mod cache;
pub mod config;
pub mod lyrics;
pub mod media;
pub mod osd;
pub mod registry;
pub mod server;

pub use cache::{CacheLayout, ContentCache};
pub use config::Config;
pub use lyrics::{LyricsEvent, LyricsFormat, LyricsHub};
pub use media::{MediaCore, ServiceResponse};
pub use osd::{HelperLocator, OsdSupervisor};
pub use registry::LocalFileRegistry;
pub use server::OriginServer;
