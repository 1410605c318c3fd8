//! Telephony response markup
//!
//! Only the verbs the call state machines emit are modelled. Documents are
//! rendered with `quick-xml`; elements are always written with explicit
//! start and end tags, which is the form the provider's own libraries emit.
//!
//! ```xml
//! <?xml version="1.0" encoding="UTF-8"?>
//! <Response><Say voice="alice">Hello</Say><Hangup></Hangup></Response>
//! ```

use std::io::Cursor;

use quick_xml::escape::partial_escape;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;

use crate::error::{ExcommsError, Result};

/// Voice used for every spoken prompt
pub const VOICE: &str = "alice";

/// One number leg of a `Dial`
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DialNumber {
    pub number: String,
    /// Markup fetched when this leg answers (call screening)
    pub url: Option<String>,
    pub status_callback_event: Option<String>,
    pub status_callback: Option<String>,
}

impl DialNumber {
    pub fn new(number: impl Into<String>) -> Self {
        Self {
            number: number.into(),
            ..Default::default()
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_status_callback(mut self, events: impl Into<String>, callback: impl Into<String>) -> Self {
        self.status_callback_event = Some(events.into());
        self.status_callback = Some(callback.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verb {
    Say { text: String, voice: Option<String> },
    Play { url: String },
    Pause { length: u32 },
    Dial {
        action: Option<String>,
        timeout: Option<u32>,
        caller_id: Option<String>,
        numbers: Vec<DialNumber>,
    },
    Gather {
        action: String,
        method: String,
        timeout: u32,
        num_digits: u32,
        verbs: Vec<Verb>,
    },
    Record {
        action: String,
        timeout: u32,
        max_length: u32,
        transcribe_callback: Option<String>,
        play_beep: bool,
    },
    Redirect { url: String },
    Reject { reason: String },
    Hangup,
}

impl Verb {
    /// `Say` in the standard voice
    pub fn say(text: impl Into<String>) -> Self {
        Self::Say {
            text: text.into(),
            voice: Some(VOICE.to_string()),
        }
    }

    pub fn play(url: impl Into<String>) -> Self {
        Self::Play { url: url.into() }
    }

    pub fn redirect(url: impl Into<String>) -> Self {
        Self::Redirect { url: url.into() }
    }

    /// Single-digit `Gather` posting to `action`
    pub fn gather_digit(action: impl Into<String>, timeout: u32, verbs: Vec<Verb>) -> Self {
        Self::Gather {
            action: action.into(),
            method: "POST".to_string(),
            timeout,
            num_digits: 1,
            verbs,
        }
    }
}

/// A markup document
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Response {
    verbs: Vec<Verb>,
}

impl Response {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_verbs(verbs: Vec<Verb>) -> Self {
        Self { verbs }
    }

    pub fn push(mut self, verb: Verb) -> Self {
        self.verbs.push(verb);
        self
    }

    pub fn verbs(&self) -> &[Verb] {
        &self.verbs
    }

    /// Render the document, declaration included.
    pub fn render(&self) -> Result<String> {
        let mut writer = Writer::new(Cursor::new(Vec::new()));

        writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
            .map_err(markup_err)?;
        writer
            .write_event(Event::Text(BytesText::from_escaped("\n")))
            .map_err(markup_err)?;

        start(&mut writer, BytesStart::new("Response"))?;
        for verb in &self.verbs {
            write_verb(&mut writer, verb)?;
        }
        end(&mut writer, "Response")?;

        let xml = writer.into_inner().into_inner();
        String::from_utf8(xml).map_err(|e| ExcommsError::Markup(e.to_string()))
    }
}

fn markup_err(e: impl std::fmt::Display) -> ExcommsError {
    ExcommsError::Markup(e.to_string())
}

type XmlWriter = Writer<Cursor<Vec<u8>>>;

fn start(writer: &mut XmlWriter, elem: BytesStart<'_>) -> Result<()> {
    writer.write_event(Event::Start(elem)).map_err(markup_err)?;
    Ok(())
}

fn end(writer: &mut XmlWriter, name: &str) -> Result<()> {
    writer.write_event(Event::End(BytesEnd::new(name))).map_err(markup_err)?;
    Ok(())
}

fn text(writer: &mut XmlWriter, value: &str) -> Result<()> {
    writer
        .write_event(Event::Text(BytesText::from_escaped(partial_escape(value))))
        .map_err(markup_err)?;
    Ok(())
}

/// Element with attributes and text content
fn text_element(writer: &mut XmlWriter, elem: BytesStart<'_>, value: &str) -> Result<()> {
    let name = String::from_utf8_lossy(elem.name().as_ref()).into_owned();
    start(writer, elem)?;
    text(writer, value)?;
    end(writer, &name)
}

fn write_verb(writer: &mut XmlWriter, verb: &Verb) -> Result<()> {
    match verb {
        Verb::Say { text: value, voice } => {
            let mut elem = BytesStart::new("Say");
            if let Some(voice) = voice {
                elem.push_attribute(("voice", voice.as_str()));
            }
            text_element(writer, elem, value)
        }
        Verb::Play { url } => text_element(writer, BytesStart::new("Play"), url),
        Verb::Pause { length } => {
            let mut elem = BytesStart::new("Pause");
            elem.push_attribute(("length", length.to_string().as_str()));
            start(writer, elem)?;
            end(writer, "Pause")
        }
        Verb::Dial {
            action,
            timeout,
            caller_id,
            numbers,
        } => {
            let mut elem = BytesStart::new("Dial");
            if let Some(action) = action {
                elem.push_attribute(("action", action.as_str()));
            }
            if let Some(timeout) = timeout {
                elem.push_attribute(("timeout", timeout.to_string().as_str()));
            }
            if let Some(caller_id) = caller_id {
                elem.push_attribute(("callerId", caller_id.as_str()));
            }
            start(writer, elem)?;
            for number in numbers {
                let mut n = BytesStart::new("Number");
                if let Some(url) = &number.url {
                    n.push_attribute(("url", url.as_str()));
                }
                if let Some(events) = &number.status_callback_event {
                    n.push_attribute(("statusCallbackEvent", events.as_str()));
                }
                if let Some(callback) = &number.status_callback {
                    n.push_attribute(("statusCallback", callback.as_str()));
                }
                text_element(writer, n, &number.number)?;
            }
            end(writer, "Dial")
        }
        Verb::Gather {
            action,
            method,
            timeout,
            num_digits,
            verbs,
        } => {
            let mut elem = BytesStart::new("Gather");
            elem.push_attribute(("action", action.as_str()));
            elem.push_attribute(("method", method.as_str()));
            elem.push_attribute(("timeout", timeout.to_string().as_str()));
            elem.push_attribute(("numDigits", num_digits.to_string().as_str()));
            start(writer, elem)?;
            for nested in verbs {
                write_verb(writer, nested)?;
            }
            end(writer, "Gather")
        }
        Verb::Record {
            action,
            timeout,
            max_length,
            transcribe_callback,
            play_beep,
        } => {
            let mut elem = BytesStart::new("Record");
            elem.push_attribute(("action", action.as_str()));
            elem.push_attribute(("timeout", timeout.to_string().as_str()));
            elem.push_attribute(("maxLength", max_length.to_string().as_str()));
            if let Some(callback) = transcribe_callback {
                elem.push_attribute(("transcribeCallback", callback.as_str()));
            }
            if *play_beep {
                elem.push_attribute(("playBeep", "true"));
            }
            start(writer, elem)?;
            end(writer, "Record")
        }
        Verb::Redirect { url } => text_element(writer, BytesStart::new("Redirect"), url),
        Verb::Reject { reason } => {
            let mut elem = BytesStart::new("Reject");
            elem.push_attribute(("reason", reason.as_str()));
            start(writer, elem)?;
            end(writer, "Reject")
        }
        Verb::Hangup => {
            start(writer, BytesStart::new("Hangup"))?;
            end(writer, "Hangup")
        }
    }
}
