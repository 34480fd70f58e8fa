use super::StreamKind;
use crate::props::PropertyTree;

/// A selectable elementary stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackInfo {
    pub id: i32,
    pub codec: String,
    pub title: Option<String>,
    pub language: Option<String>,
}

impl TrackInfo {
    pub fn new(id: i32, codec: impl Into<String>) -> Self {
        Self {
            id,
            codec: codec.into(),
            title: None,
            language: None,
        }
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }
}

/// Tracks discovered by a producer, per stream kind
#[derive(Debug, Clone, Default)]
pub struct TrackList {
    audio: Vec<TrackInfo>,
    subtitle: Vec<TrackInfo>,
    video: Vec<TrackInfo>,
}

impl TrackList {
    pub fn new() -> Self {
        Self::default()
    }

    fn list_mut(&mut self, kind: StreamKind) -> &mut Vec<TrackInfo> {
        match kind {
            StreamKind::Audio => &mut self.audio,
            StreamKind::Video => &mut self.video,
            StreamKind::Subtitle => &mut self.subtitle,
        }
    }

    pub fn tracks(&self, kind: StreamKind) -> &[TrackInfo] {
        match kind {
            StreamKind::Audio => &self.audio,
            StreamKind::Video => &self.video,
            StreamKind::Subtitle => &self.subtitle,
        }
    }

    /// Add a track unless one with the same id is already known.
    /// Returns true when the list changed.
    pub fn add(&mut self, kind: StreamKind, track: TrackInfo) -> bool {
        let list = self.list_mut(kind);
        if list.iter().any(|t| t.id == track.id) {
            return false;
        }
        list.push(track);
        true
    }

    pub fn contains(&self, kind: StreamKind, id: i32) -> bool {
        self.tracks(kind).iter().any(|t| t.id == id)
    }

    /// First track of a kind, the default selection
    pub fn first(&self, kind: StreamKind) -> Option<&TrackInfo> {
        self.tracks(kind).first()
    }
}

/// Publish `tracks` under `<kind>.tracks.*`
pub(crate) fn publish(props: &PropertyTree, kind: StreamKind, tracks: &[TrackInfo]) {
    let prefix = format!("{}.tracks", kind.name());
    props.set(&format!("{prefix}.count"), tracks.len() as i64);
    for (i, t) in tracks.iter().enumerate() {
        props.set(&format!("{prefix}.{i}.id"), t.id as i64);
        props.set(&format!("{prefix}.{i}.codec"), t.codec.as_str());
        props.set(
            &format!("{prefix}.{i}.title"),
            t.title.clone().unwrap_or_default(),
        );
        props.set(
            &format!("{prefix}.{i}.language"),
            t.language.clone().unwrap_or_default(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_dedup() {
        let mut list = TrackList::new();
        assert!(list.add(StreamKind::Audio, TrackInfo::new(0x80, "ac3")));
        assert!(!list.add(StreamKind::Audio, TrackInfo::new(0x80, "ac3")));
        assert!(list.add(StreamKind::Audio, TrackInfo::new(0x81, "dts").with_language("de")));
        assert_eq!(list.tracks(StreamKind::Audio).len(), 2);
        assert_eq!(list.first(StreamKind::Audio).unwrap().id, 0x80);
        assert!(list.contains(StreamKind::Audio, 0x81));
        assert!(!list.contains(StreamKind::Subtitle, 0x81));
    }

    #[test]
    fn test_publish() {
        let props = PropertyTree::new();
        let tracks = [
            TrackInfo::new(1, "aac").with_title("Commentary"),
            TrackInfo::new(2, "ac3"),
        ];
        publish(&props, StreamKind::Audio, &tracks);
        assert_eq!(props.get_int("audio.tracks.count"), Some(2));
        assert_eq!(props.get_str("audio.tracks.0.title").as_deref(), Some("Commentary"));
        assert_eq!(props.get_int("audio.tracks.1.id"), Some(2));
    }
}
