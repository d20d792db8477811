//! Leaflet HTML surface.
//!
//! Writes a self-contained page that draws the view with Leaflet. The page
//! can reload itself so a browser tab follows the live roster.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::json;
use tracing::debug;

use super::{MapSurface, MapUpdate, MapView};
use crate::config::MapConfig;
use crate::error::{Error, Result};

/// Leaflet release the page loads.
const LEAFLET_VERSION: &str = "1.9.4";

/// Page template. `__REFRESH__` and `__DATA__` are replaced on render.
const TEMPLATE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
__REFRESH__<title>Family Map</title>
<link rel="stylesheet" href="https://unpkg.com/leaflet@__LEAFLET__/dist/leaflet.css">
<script src="https://unpkg.com/leaflet@__LEAFLET__/dist/leaflet.js"></script>
<style>
html, body, #map { height: 100%; width: 100%; margin: 0; background: #1e293b; }
.popup-title { font-weight: bold; margin: 0; }
.popup-subtitle { font-size: 0.75rem; color: #6b7280; margin: 0; }
</style>
</head>
<body>
<div id="map"></div>
<script>
const data = __DATA__;
const icon = L.icon({
  iconUrl: "https://unpkg.com/leaflet@__LEAFLET__/dist/images/marker-icon.png",
  shadowUrl: "https://unpkg.com/leaflet@__LEAFLET__/dist/images/marker-shadow.png",
  iconSize: [25, 41],
  iconAnchor: [12, 41]
});
const map = L.map("map", { zoomControl: false })
  .setView([data.view.center.lat, data.view.center.lng], data.view.zoom);
L.tileLayer(data.tiles.url, { attribution: data.tiles.attribution }).addTo(map);
for (const marker of data.view.markers) {
  const popup = document.createElement("div");
  const title = document.createElement("p");
  title.className = "popup-title";
  title.textContent = marker.title;
  const subtitle = document.createElement("p");
  subtitle.className = "popup-subtitle";
  subtitle.textContent = marker.subtitle;
  popup.append(title, subtitle);
  L.marker([marker.position.lat, marker.position.lng], { icon }).bindPopup(popup).addTo(map);
}
</script>
</body>
</html>
"#;

/// Page settings that do not change between renders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageOptions {
    /// Tile URL template.
    pub tile_url: String,
    /// Attribution HTML.
    pub attribution: String,
    /// Reload the page this often, if set.
    pub reload: Option<Duration>,
}

impl PageOptions {
    /// Page settings from the map configuration.
    #[must_use]
    pub fn from_config(config: &MapConfig) -> Self {
        Self {
            tile_url: config.tile_url.clone(),
            attribution: config.attribution.clone(),
            reload: (config.reload_secs > 0)
                .then(|| Duration::from_secs(u64::from(config.reload_secs))),
        }
    }
}

/// Render `view` as a Leaflet page.
///
/// # Errors
///
/// Returns an error if the view cannot be serialized.
pub fn render_page(view: &MapView, options: &PageOptions) -> Result<String> {
    let data = json!({
        "view": view,
        "tiles": {
            "url": options.tile_url,
            "attribution": options.attribution,
        },
    });
    // Keep member names from closing the script element
    let data = serde_json::to_string(&data)?.replace("</", "<\\/");
    let refresh = options
        .reload
        .map(|every| {
            format!(
                "<meta http-equiv=\"refresh\" content=\"{}\">\n",
                every.as_secs().max(1)
            )
        })
        .unwrap_or_default();

    Ok(TEMPLATE
        .replace("__LEAFLET__", LEAFLET_VERSION)
        .replace("__REFRESH__", &refresh)
        .replace("__DATA__", &data))
}

/// Writes each view to an HTML file.
#[derive(Debug, Clone)]
pub struct HtmlFileSurface {
    path: PathBuf,
    options: PageOptions,
}

impl HtmlFileSurface {
    /// Create a surface writing to `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, options: PageOptions) -> Self {
        Self {
            path: path.into(),
            options,
        }
    }

    /// Where the page is written.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MapSurface for HtmlFileSurface {
    fn name(&self) -> &'static str {
        "html"
    }

    fn present(&mut self, update: &MapUpdate) -> Result<()> {
        let page = render_page(&update.view, &self.options)?;
        write_atomic(&self.path, page.as_bytes())?;
        debug!(
            path = %self.path.display(),
            markers = update.view.markers.len(),
            "Wrote map page"
        );
        Ok(())
    }
}

/// Write through a temporary file so readers never see a partial page.
fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| Error::DirectoryCreate {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path).map_err(|e| {
        let _ = std::fs::remove_file(&tmp);
        Error::Io(e)
    })
}
