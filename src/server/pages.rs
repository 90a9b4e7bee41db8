//! HTML pages

use axum::response::Html;
use std::fmt::Write;

use crate::camera::CameraId;

/// `GET /`
pub async fn index() -> Html<String> {
    let mut items = String::new();
    for camera in CameraId::all() {
        let _ = writeln!(
            items,
            "      <li><a href=\"/{slug}\">{slug}</a> (<a href=\"/stream/{slug}\">raw stream</a>)</li>",
            slug = camera.slug()
        );
    }

    Html(format!(
        "<!DOCTYPE html>
<html>
  <head>
    <meta charset=\"utf-8\">
    <title>camrelay</title>
  </head>
  <body>
    <h1>Cameras</h1>
    <ul>
{items}    </ul>
  </body>
</html>
"
    ))
}

/// `GET /cam{N}`
pub async fn viewer(camera: CameraId) -> Html<String> {
    Html(format!(
        "<!DOCTYPE html>
<html>
  <head>
    <meta charset=\"utf-8\">
    <title>{camera}</title>
    <style>
      body {{ margin: 0; background: #000; }}
      img {{ display: block; width: 100vw; height: 100vh; object-fit: contain; }}
    </style>
  </head>
  <body>
    <img src=\"/stream/{camera}\" alt=\"{camera}\">
  </body>
</html>
"
    ))
}
