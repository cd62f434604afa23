//! Session-description rewriting for the transcoder input
//!
//! The transcoder reads plain RTP from loopback ports, so the provider's
//! answer is reduced to its codec description and pointed at the ports
//! reserved for this session.

use crate::{Error, Result};

/// Ports the transcoder listens on for one session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaPorts {
    pub audio: u16,
    pub video: u16,
}

/// Substitute the port of every `m=audio` / `m=video` line.
///
/// Every other byte of the description, line endings included, is preserved.
pub fn rewrite_media_ports(sdp: &str, ports: MediaPorts) -> String {
    let mut out = String::with_capacity(sdp.len() + 16);
    for raw in sdp.split_inclusive('\n') {
        let (line, ending) = split_line_ending(raw);
        match media_kind(line) {
            Some(MediaKind::Audio) => out.push_str(&replace_port(line, ports.audio)),
            Some(MediaKind::Video) => out.push_str(&replace_port(line, ports.video)),
            _ => out.push_str(line),
        }
        out.push_str(ending);
    }
    out
}

/// Build the description fed to the transcoder from a remote answer.
///
/// Connection addresses become `127.0.0.1`, the transport profile becomes
/// `RTP/AVP`, transport-security and ICE attributes are dropped and only the
/// audio and video sections survive, with their ports rewritten. Each section
/// names its RTCP port (RTP port + 1) explicitly.
pub fn transcoder_sdp(answer: &str, ports: MediaPorts) -> Result<String> {
    let mut session = Vec::new();
    let mut sections: Vec<Vec<String>> = Vec::new();
    let mut keep_section = false;

    for raw in answer.lines() {
        let line = raw.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        if line.starts_with("m=") {
            let rtp_port = match media_kind(line) {
                Some(MediaKind::Audio) => Some(ports.audio),
                Some(MediaKind::Video) => Some(ports.video),
                _ => None,
            };
            keep_section = rtp_port.is_some();
            if let Some(rtp_port) = rtp_port {
                sections.push(vec![
                    plain_rtp_media_line(line),
                    format!("a=rtcp:{}", u32::from(rtp_port) + 1),
                ]);
            }
            continue;
        }

        if sections.is_empty() {
            match line.get(..2) {
                Some("v=") | Some("o=") | Some("s=") | Some("t=") => session.push(line.to_string()),
                _ => {}
            }
        } else if keep_section && keeps_media_attribute(line) {
            if let Some(section) = sections.last_mut() {
                section.push(line.to_string());
            }
        }
    }

    if sections.is_empty() {
        return Err(Error::TranscoderError(
            "remote description has no audio or video section".to_string(),
        ));
    }

    let mut lines: Vec<String> = Vec::new();
    let mut has_timing = false;
    for line in session {
        if line.starts_with("t=") {
            lines.push("c=IN IP4 127.0.0.1".to_string());
            has_timing = true;
        }
        lines.push(line);
    }
    if !has_timing {
        lines.push("c=IN IP4 127.0.0.1".to_string());
        lines.push("t=0 0".to_string());
    }
    if !lines.iter().any(|l| l.starts_with("v=")) {
        lines.insert(0, "v=0".to_string());
    }
    for section in sections {
        lines.extend(section);
    }

    let mut sdp = lines.join("\r\n");
    sdp.push_str("\r\n");
    Ok(rewrite_media_ports(&sdp, ports))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MediaKind {
    Audio,
    Video,
    Other,
}

fn media_kind(line: &str) -> Option<MediaKind> {
    let rest = line.strip_prefix("m=")?;
    Some(match rest.split(' ').next() {
        Some("audio") => MediaKind::Audio,
        Some("video") => MediaKind::Video,
        _ => MediaKind::Other,
    })
}

fn split_line_ending(raw: &str) -> (&str, &str) {
    if let Some(line) = raw.strip_suffix("\r\n") {
        (line, "\r\n")
    } else if let Some(line) = raw.strip_suffix('\n') {
        (line, "\n")
    } else {
        (raw, "")
    }
}

fn replace_port(line: &str, port: u16) -> String {
    let mut fields: Vec<&str> = line.split(' ').collect();
    if fields.len() < 2 {
        return line.to_string();
    }
    let port = port.to_string();
    fields[1] = &port;
    fields.join(" ")
}

fn plain_rtp_media_line(line: &str) -> String {
    let mut fields: Vec<&str> = line.split(' ').collect();
    if fields.len() >= 3 {
        fields[2] = "RTP/AVP";
    }
    fields.join(" ")
}

fn keeps_media_attribute(line: &str) -> bool {
    line.starts_with("a=rtpmap:") || line.starts_with("a=fmtp:")
}

#[cfg(test)]
mod tests {
    use super::*;

    const PORTS: MediaPorts = MediaPorts {
        audio: 41002,
        video: 41004,
    };

    const ANSWER: &str = "v=0\r\n\
o=- 4611731400430051336 2 IN IP4 10.0.0.5\r\n\
s=-\r\n\
t=0 0\r\n\
a=group:BUNDLE 0 1\r\n\
a=msid-semantic: WMS\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
c=IN IP4 0.0.0.0\r\n\
a=rtcp:9 IN IP4 0.0.0.0\r\n\
a=ice-ufrag:abcd\r\n\
a=ice-pwd:efghijklmnop\r\n\
a=fingerprint:sha-256 00:11:22\r\n\
a=setup:active\r\n\
a=mid:0\r\n\
a=sendrecv\r\n\
a=rtcp-mux\r\n\
a=rtpmap:111 opus/48000/2\r\n\
a=fmtp:111 minptime=10;useinbandfec=1\r\n\
a=ssrc:1111 cname:cam\r\n\
a=candidate:1 1 udp 2130706431 10.0.0.5 5000 typ host\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
c=IN IP4 0.0.0.0\r\n\
a=mid:1\r\n\
a=sendonly\r\n\
a=rtpmap:96 H264/90000\r\n\
a=fmtp:96 packetization-mode=1;profile-level-id=42e01f\r\n\
a=rtcp-fb:96 nack pli\r\n\
m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n\
a=mid:2\r\n";

    #[test]
    fn test_rewrite_only_touches_media_ports() {
        let input = "v=0\r\nm=audio PORT_A RTP/AVP 0 101\r\na=rtpmap:0 PCMU/8000\r\nm=video PORT_V RTP/AVP 96\r\na=rtpmap:96 H264/90000\r\n";
        let out = rewrite_media_ports(input, PORTS);
        assert_eq!(
            out,
            "v=0\r\nm=audio 41002 RTP/AVP 0 101\r\na=rtpmap:0 PCMU/8000\r\nm=video 41004 RTP/AVP 96\r\na=rtpmap:96 H264/90000\r\n"
        );

        let in_lines: Vec<&str> = input.split("\r\n").collect();
        let out_lines: Vec<&str> = out.split("\r\n").collect();
        assert_eq!(in_lines.len(), out_lines.len());
        for (a, b) in in_lines.iter().zip(&out_lines) {
            if !a.starts_with("m=") {
                assert_eq!(a, b);
            }
        }
    }

    #[test]
    fn test_rewrite_preserves_bare_newlines_and_other_sections() {
        let input = "m=audio 1 RTP/AVP 0\nm=application 5000 UDP/DTLS/SCTP x\nm=video 2/2 RTP/AVP 96";
        let out = rewrite_media_ports(input, PORTS);
        assert_eq!(
            out,
            "m=audio 41002 RTP/AVP 0\nm=application 5000 UDP/DTLS/SCTP x\nm=video 41004 RTP/AVP 96"
        );
    }

    #[test]
    fn test_transcoder_sdp_from_answer() {
        let sdp = transcoder_sdp(ANSWER, PORTS).unwrap();

        assert!(sdp.contains("m=audio 41002 RTP/AVP 111\r\na=rtcp:41003\r\n"));
        assert!(sdp.contains("m=video 41004 RTP/AVP 96\r\na=rtcp:41005\r\n"));
        // the answer's own rtcp attribute pointed at the ICE port
        assert!(!sdp.contains("a=rtcp:9"));
        assert!(sdp.contains("c=IN IP4 127.0.0.1\r\n"));
        assert!(sdp.contains("a=rtpmap:111 opus/48000/2"));
        assert!(sdp.contains("a=fmtp:96 packetization-mode=1;profile-level-id=42e01f"));
        assert!(sdp.starts_with("v=0\r\n"));

        for dropped in [
            "a=ice-ufrag",
            "a=fingerprint",
            "a=candidate",
            "a=ssrc",
            "a=rtcp-mux",
            "a=group",
            "m=application",
            "0.0.0.0",
            "SAVPF",
        ] {
            assert!(!sdp.contains(dropped), "{} should be stripped", dropped);
        }

        // audio section precedes video, as in the answer
        let audio = sdp.find("m=audio").unwrap();
        let video = sdp.find("m=video").unwrap();
        assert!(audio < video);
    }

    #[test]
    fn test_transcoder_sdp_requires_media() {
        let err = transcoder_sdp("v=0\r\ns=-\r\nt=0 0\r\n", PORTS).unwrap_err();
        assert!(matches!(err, Error::TranscoderError(_)));
    }

    #[test]
    fn test_transcoder_sdp_without_timing_line() {
        let sdp = transcoder_sdp("v=0\nm=audio 9 RTP/AVP 0\na=rtpmap:0 PCMU/8000\n", PORTS).unwrap();
        assert!(sdp.contains("c=IN IP4 127.0.0.1\r\nt=0 0\r\nm=audio 41002 RTP/AVP 0\r\na=rtcp:41003"));
    }
}
