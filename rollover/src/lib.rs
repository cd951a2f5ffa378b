//! Rollover library for a rich-text todo note.
//! The note is parsed into an owned markup tree, split into today/later/settings sections,
//! pending tasks are moved across the day boundary and completed ones are archived.

pub mod model {
    use chrono::{Datelike, NaiveDate};
    use indexmap::IndexMap;
    use serde::{Deserialize, Serialize};
    use std::{fmt, str::FromStr};
    use uuid::Uuid;

    /* ------------------------------- Tags ------------------------------- */

    pub const ROOT_TAG: &str = "en-note";
    pub const TODO_TAG: &str = "en-todo";
    pub const LINE_BREAK_TAG: &str = "br";
    pub const WRAPPER_TAG: &str = "div";
    pub const LIST_ITEM_TAG: &str = "li";
    pub const EMPHASIS_TAGS: [&str; 2] = ["strong", "b"];

    /* ------------------------------- IDs ------------------------------- */

    /// Identifies one rollover run in logs and reports.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct RunId(pub Uuid);

    impl RunId {
        pub fn new() -> Self {
            Self(Uuid::new_v4())
        }
    }

    impl fmt::Display for RunId {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    /* ------------------------------ Tree ------------------------------ */

    /// One element of the markup tree.
    ///
    /// `text` is the content before the first child and `tail` the content that follows the
    /// element inside its parent. Children are owned and kept in document order.
    /// Attribute order is kept for serialization; equality ignores it.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct Node {
        pub tag: String,
        #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
        pub attributes: IndexMap<String, String>,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        pub text: String,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        pub tail: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        pub children: Vec<Node>,
    }

    impl Node {
        pub fn new(tag: impl Into<String>) -> Self {
            Self {
                tag: tag.into(),
                ..Self::default()
            }
        }

        pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
            self.attributes.insert(name.into(), value.into());
            self
        }

        pub fn with_text(mut self, text: impl Into<String>) -> Self {
            self.text = text.into();
            self
        }

        pub fn with_tail(mut self, tail: impl Into<String>) -> Self {
            self.tail = tail.into();
            self
        }

        pub fn with_child(mut self, child: Node) -> Self {
            self.children.push(child);
            self
        }

        /// Text of the node, all of its descendants and its own tail, in document order.
        pub fn text_content(&self) -> String {
            fn rec(node: &Node, out: &mut String) {
                out.push_str(&node.text);
                for child in &node.children {
                    rec(child, out);
                }
                out.push_str(&node.tail);
            }
            let mut s = String::new();
            rec(self, &mut s);
            s
        }

        pub fn contains_tag(&self, tag: &str) -> bool {
            self.tag == tag || self.children.iter().any(|c| c.contains_tag(tag))
        }

        /// Outermost elements named `tag`; a match is not searched any further.
        pub fn find_all<'a>(&'a self, tag: &str) -> Vec<&'a Node> {
            fn rec<'a>(node: &'a Node, tag: &str, out: &mut Vec<&'a Node>) {
                if node.tag == tag {
                    out.push(node);
                    return;
                }
                for child in &node.children {
                    rec(child, tag, out);
                }
            }
            let mut out = Vec::new();
            rec(self, tag, &mut out);
            out
        }

        /// A block that is or holds a checklist marker opens a new task.
        pub fn starts_checklist(&self) -> bool {
            self.contains_tag(TODO_TAG)
        }

        /// True when any checklist marker in the subtree is checked.
        pub fn is_checked(&self) -> bool {
            if self.tag == TODO_TAG {
                return self
                    .attributes
                    .get("checked")
                    .is_some_and(|v| v.trim() == "true");
            }
            self.children.iter().any(Node::is_checked)
        }

        pub fn has_emphasis(&self) -> bool {
            EMPHASIS_TAGS.iter().any(|t| self.contains_tag(t))
        }
    }

    pub fn is_blank(s: &str) -> bool {
        s.trim().is_empty()
    }

    /* ---------------------------- Date format ---------------------------- */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub enum DateField {
        Day,
        Month,
        Year,
    }

    impl DateField {
        fn from_char(c: char) -> Option<Self> {
            match c.to_ascii_lowercase() {
                'd' => Some(Self::Day),
                'm' => Some(Self::Month),
                'y' => Some(Self::Year),
                _ => None,
            }
        }

        fn letter(self) -> char {
            match self {
                Self::Day => 'd',
                Self::Month => 'm',
                Self::Year => 'y',
            }
        }

        fn of(self, date: NaiveDate) -> i64 {
            match self {
                Self::Day => i64::from(date.day()),
                Self::Month => i64::from(date.month()),
                Self::Year => i64::from(date.year()),
            }
        }
    }

    /// Ordered day/month/year fields used both to read and to render dates.
    ///
    /// Written in the note as the field letters, e.g. `dmy` or `m/d/y`; anything that is not
    /// a letter or digit is ignored.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(try_from = "String", into = "String")]
    pub struct DateFormat {
        fields: Vec<DateField>,
    }

    impl DateFormat {
        pub fn new(fields: Vec<DateField>) -> Result<Self, RolloverError> {
            let complete = [DateField::Day, DateField::Month, DateField::Year]
                .iter()
                .all(|f| fields.iter().filter(|x| *x == f).count() == 1);
            if fields.len() != 3 || !complete {
                let letters: String = fields.iter().map(|f| f.letter()).collect();
                return Err(RolloverError::InvalidDateFormat(letters));
            }
            Ok(Self { fields })
        }

        pub fn fields(&self) -> &[DateField] {
            &self.fields
        }

        /// Numeric fields joined by `separator`, without padding (`3/7/2024`).
        pub fn render(&self, date: NaiveDate, separator: &str) -> String {
            self.fields
                .iter()
                .map(|f| f.of(date).to_string())
                .collect::<Vec<_>>()
                .join(separator)
        }

        /// Matches the runs of digits in `value` to the fields in order.
        /// Yields a date only when day, month and year were all read and form a real date.
        pub fn read(&self, value: &str) -> Option<NaiveDate> {
            let (mut day, mut month, mut year) = (None, None, None);
            let digits = value
                .split(|c: char| !c.is_ascii_digit())
                .filter(|run| !run.is_empty());
            for (field, run) in self.fields.iter().zip(digits) {
                match field {
                    DateField::Day => day = run.parse::<u32>().ok(),
                    DateField::Month => month = run.parse::<u32>().ok(),
                    DateField::Year => year = run.parse::<i32>().ok(),
                }
            }
            NaiveDate::from_ymd_opt(year?, month?, day?)
        }
    }

    impl FromStr for DateFormat {
        type Err = RolloverError;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            let invalid = || RolloverError::InvalidDateFormat(s.to_string());
            let mut fields = Vec::new();
            for c in s.chars().filter(|c| c.is_alphanumeric()) {
                fields.push(DateField::from_char(c).ok_or_else(invalid)?);
            }
            Self::new(fields).map_err(|_| invalid())
        }
    }

    impl TryFrom<String> for DateFormat {
        type Error = RolloverError;

        fn try_from(value: String) -> Result<Self, Self::Error> {
            value.parse()
        }
    }

    impl From<DateFormat> for String {
        fn from(value: DateFormat) -> Self {
            value.to_string()
        }
    }

    impl fmt::Display for DateFormat {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            for field in &self.fields {
                write!(f, "{}", field.letter())?;
            }
            Ok(())
        }
    }

    /// How often a new history note is started.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum Periodicity {
        Daily,
        #[default]
        Weekly,
        Monthly,
    }

    impl Periodicity {
        /// Unknown values read as weekly.
        pub fn from_setting(value: &str) -> Self {
            match value.trim().to_ascii_lowercase().as_str() {
                "daily" => Self::Daily,
                "monthly" => Self::Monthly,
                _ => Self::Weekly,
            }
        }
    }

    /* ----------------------------- Settings ----------------------------- */

    /// Typed view of the key/value list kept under the settings header of the note.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Settings {
        pub date_format: DateFormat,
        pub date_separator: String,
        pub history_notebook: String,
        pub history_interval: Periodicity,
        /// Title prefix of the history notes.
        pub history_note: String,
    }

    impl Settings {
        pub const DATE_FORMAT: &'static str = "Date format";
        pub const DATE_SEPARATOR: &'static str = "Date separator";
        pub const HISTORY_NOTEBOOK: &'static str = "History notebook";
        pub const HISTORY_INTERVAL: &'static str = "History interval";
        pub const HISTORY_NOTE: &'static str = "History note";

        pub fn from_map(map: &IndexMap<String, String>) -> Result<Self, RolloverError> {
            let get = |key: &str| {
                map.get(key)
                    .map(|v| v.trim().to_string())
                    .ok_or_else(|| RolloverError::MissingSetting(key.to_string()))
            };
            Ok(Self {
                date_format: get(Self::DATE_FORMAT)?.parse()?,
                date_separator: get(Self::DATE_SEPARATOR)?,
                history_notebook: get(Self::HISTORY_NOTEBOOK)?,
                history_interval: Periodicity::from_setting(&get(Self::HISTORY_INTERVAL)?),
                history_note: get(Self::HISTORY_NOTE)?,
            })
        }

        pub fn render_date(&self, date: NaiveDate) -> String {
            self.date_format.render(date, &self.date_separator)
        }
    }

    /* ---------------------------- Errors (domain) ---------------------------- */

    #[derive(Debug, thiserror::Error)]
    pub enum RolloverError {
        #[error("malformed document: {0}")]
        MalformedDocument(String),
        #[error("missing setting {0:?}")]
        MissingSetting(String),
        #[error("invalid date format {0:?}: expected each of d, m and y exactly once")]
        InvalidDateFormat(String),
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn date(y: i32, m: u32, d: u32) -> NaiveDate {
            NaiveDate::from_ymd_opt(y, m, d).unwrap()
        }

        #[test]
        fn date_format_accepts_letters_with_punctuation() {
            let plain: DateFormat = "dmy".parse().expect("dmy");
            let spaced: DateFormat = "m / d / y".parse().expect("m/d/y");
            assert_eq!(
                plain.fields(),
                &[DateField::Day, DateField::Month, DateField::Year]
            );
            assert_eq!(
                spaced.fields(),
                &[DateField::Month, DateField::Day, DateField::Year]
            );
        }

        #[test]
        fn date_format_rejects_incomplete_or_foreign_fields() {
            for bad in ["dm", "ddmy", "dmx", "", "d1y"] {
                let err = bad.parse::<DateFormat>().unwrap_err();
                assert!(matches!(err, RolloverError::InvalidDateFormat(ref s) if s == bad));
            }
        }

        #[test]
        fn reads_and_renders_positionally() {
            let mdy: DateFormat = "mdy".parse().unwrap();
            assert_eq!(mdy.read("3/15/2024"), Some(date(2024, 3, 15)));
            assert_eq!(mdy.render(date(2024, 3, 5), "/"), "3/5/2024");
            // Missing year, and a day that does not exist.
            assert_eq!(mdy.read("3/15"), None);
            assert_eq!(mdy.read("2/30/2024"), None);
        }

        #[test]
        fn checked_marker_anywhere_in_block_completes_it() {
            let block = Node::new("div").with_child(
                Node::new("span")
                    .with_child(Node::new(TODO_TAG).with_attribute("checked", "true"))
                    .with_tail("done"),
            );
            assert!(block.starts_checklist());
            assert!(block.is_checked());

            let open = Node::new("div").with_child(Node::new(TODO_TAG).with_attribute("checked", "false"));
            assert!(open.starts_checklist());
            assert!(!open.is_checked());
        }

        #[test]
        fn text_content_includes_tails() {
            let block = Node::new("div")
                .with_text("a")
                .with_child(Node::new("b").with_text("b").with_tail("c"))
                .with_tail("d");
            assert_eq!(block.text_content(), "abcd");
        }

        #[test]
        fn find_all_stops_at_outermost_match() {
            let list = Node::new("ul")
                .with_child(Node::new("li").with_child(Node::new("li").with_text("inner")))
                .with_child(Node::new("li").with_text("second"));
            let items = list.find_all("li");
            assert_eq!(items.len(), 2);
            assert_eq!(items[1].text, "second");
        }

        #[test]
        fn settings_report_the_first_missing_key() {
            let mut map = IndexMap::new();
            map.insert("Date format".to_string(), "dmy".to_string());
            map.insert("Date separator".to_string(), ".".to_string());
            let err = Settings::from_map(&map).unwrap_err();
            assert!(matches!(err, RolloverError::MissingSetting(ref k) if k == "History notebook"));

            map.insert("History notebook".to_string(), "Archive".to_string());
            map.insert("History interval".to_string(), "fortnightly".to_string());
            map.insert("History note".to_string(), "Done".to_string());
            let settings = Settings::from_map(&map).expect("complete settings");
            assert_eq!(settings.history_interval, Periodicity::Weekly);
            assert_eq!(settings.render_date(date(2024, 1, 9)), "9.1.2024");
        }
    }
}

pub mod parser {
    //! Markup parser built on `nom`.
    //!
    //! Only the element tree matters downstream: the XML declaration, DOCTYPE, comments and
    //! processing instructions are skipped, CDATA and character references become plain text.
    //! Whitespace between elements is kept as text/tail so untouched regions reserialize as-is.

    use crate::model::{Node, RolloverError};
    use nom::{
        IResult,
        branch::alt,
        bytes::complete::{tag, take_until, take_while, take_while1},
        character::complete::{alpha1, char, digit1, hex_digit1, multispace0, multispace1, one_of},
        combinator::{cut, map, map_opt, map_res, value},
        error::{VerboseError, VerboseErrorKind, context},
        multi::many0,
        sequence::{delimited, preceded, separated_pair, tuple},
    };

    /* ------------------------ Public entry points ------------------------ */

    /// Parse a markup document (or a bare element) into its root node.
    pub fn parse_document(input: &str) -> Result<Node, RolloverError> {
        let input = input.strip_prefix('\u{feff}').unwrap_or(input);
        let (rest, ()) = misc(input).map_err(to_rollover_error("prolog"))?;
        let (rest, root) = element(rest).map_err(to_rollover_error("root element"))?;
        let (rest, ()) = misc(rest).map_err(to_rollover_error("epilog"))?;
        if !rest.is_empty() {
            return Err(RolloverError::MalformedDocument(format!(
                "unexpected content after the root element: {:?}",
                first_line(rest)
            )));
        }
        Ok(root)
    }

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    fn to_rollover_error(
        label: &'static str,
    ) -> impl Fn(nom::Err<VerboseError<&str>>) -> RolloverError {
        move |e| match e {
            nom::Err::Error(ve) | nom::Err::Failure(ve) => {
                RolloverError::MalformedDocument(pretty_verbose_error(label, ve))
            }
            nom::Err::Incomplete(_) => {
                RolloverError::MalformedDocument(format!("incomplete input while parsing {label}"))
            }
        }
    }

    fn pretty_verbose_error(label: &str, ve: VerboseError<&str>) -> String {
        use std::fmt::Write;
        let mut s = String::new();
        let _ = write!(s, "parse error in {}", label);
        for (frag, kind) in ve.errors {
            let _ = write!(s, "; at {:?} {:?}", first_line(frag), kind);
        }
        s
    }

    fn first_line(s: &str) -> &str {
        let line = s.lines().next().unwrap_or(s);
        match line.char_indices().nth(60) {
            Some((idx, _)) => &line[..idx],
            None => line,
        }
    }

    fn failure<'a, T>(at: &'a str, what: &'static str) -> PResult<'a, T> {
        Err(nom::Err::Failure(VerboseError {
            errors: vec![(at, VerboseErrorKind::Context(what))],
        }))
    }

    /* ------------------------------ Prolog ------------------------------ */

    fn misc(i: &str) -> PResult<'_, ()> {
        map(
            many0(alt((
                value((), multispace1),
                comment,
                processing_instruction,
                doctype,
            ))),
            |_| (),
        )(i)
    }

    fn comment(i: &str) -> PResult<'_, ()> {
        value((), delimited(tag("<!--"), take_until("-->"), tag("-->")))(i)
    }

    fn cdata(i: &str) -> PResult<'_, &str> {
        delimited(tag("<![CDATA["), take_until("]]>"), tag("]]>"))(i)
    }

    fn processing_instruction(i: &str) -> PResult<'_, ()> {
        value((), delimited(tag("<?"), take_until("?>"), tag("?>")))(i)
    }

    fn doctype(i: &str) -> PResult<'_, ()> {
        let (rest, _) = tag("<!DOCTYPE")(i)?;
        // An internal subset may hold '>' inside brackets.
        let mut depth = 0usize;
        for (idx, c) in rest.char_indices() {
            match c {
                '[' => depth += 1,
                ']' => depth = depth.saturating_sub(1),
                '>' if depth == 0 => return Ok((&rest[idx + 1..], ())),
                _ => {}
            }
        }
        failure(i, "unterminated doctype")
    }

    /* ------------------------------ Elements ------------------------------ */

    fn xml_name(i: &str) -> PResult<'_, &str> {
        take_while1(|c: char| c.is_alphanumeric() || matches!(c, '-' | '_' | ':' | '.'))(i)
    }

    fn attribute(i: &str) -> PResult<'_, (&str, String)> {
        preceded(
            multispace1,
            separated_pair(
                xml_name,
                tuple((multispace0, char('='), multispace0)),
                quoted_value,
            ),
        )(i)
    }

    fn quoted_value(i: &str) -> PResult<'_, String> {
        map(
            alt((
                delimited(char('"'), take_while(|c: char| c != '"'), char('"')),
                delimited(char('\''), take_while(|c: char| c != '\''), char('\'')),
            )),
            decode_entities,
        )(i)
    }

    fn element(i: &str) -> PResult<'_, Node> {
        let (i, _) = char('<')(i)?;
        let (i, name) = xml_name(i)?;
        let (i, attributes) = many0(attribute)(i)?;
        let (i, _) = multispace0(i)?;

        let mut node = Node::new(name);
        for (key, val) in attributes {
            node.attributes.insert(key.to_string(), val);
        }
        if let Some(rest) = i.strip_prefix("/>") {
            return Ok((rest, node));
        }
        let (mut i, _) = context("start tag", cut(char('>')))(i)?;

        loop {
            let (rest, text) = take_while(|c: char| c != '<')(i)?;
            if !text.is_empty() {
                append_text(&mut node, &decode_entities(text));
            }
            i = rest;

            if i.is_empty() {
                return failure(i, "unclosed element");
            }
            if i.starts_with("</") {
                let (rest, closing) = context(
                    "end tag",
                    cut(delimited(
                        tag("</"),
                        xml_name,
                        preceded(multispace0, char('>')),
                    )),
                )(i)?;
                if closing != node.tag {
                    return failure(i, "mismatched end tag");
                }
                return Ok((rest, node));
            }
            if i.starts_with("<!--") {
                let (rest, ()) = context("comment", cut(comment))(i)?;
                i = rest;
                continue;
            }
            if i.starts_with("<![CDATA[") {
                let (rest, data) = context("cdata", cut(cdata))(i)?;
                append_text(&mut node, data);
                i = rest;
                continue;
            }
            if i.starts_with("<?") {
                let (rest, ()) = context("processing instruction", cut(processing_instruction))(i)?;
                i = rest;
                continue;
            }
            let (rest, child) = context("child element", cut(element))(i)?;
            node.children.push(child);
            i = rest;
        }
    }

    /// Text before the first child is the node's text, later text is the last child's tail.
    fn append_text(node: &mut Node, text: &str) {
        match node.children.last_mut() {
            Some(last) => last.tail.push_str(text),
            None => node.text.push_str(text),
        }
    }

    /* ----------------------------- Entities ----------------------------- */

    /// Unknown references are kept verbatim.
    fn decode_entities(raw: &str) -> String {
        if !raw.contains('&') {
            return raw.to_string();
        }
        let mut out = String::with_capacity(raw.len());
        let mut rest = raw;
        while let Some(pos) = rest.find('&') {
            out.push_str(&rest[..pos]);
            let at = &rest[pos..];
            match entity(at) {
                Ok((r, ch)) => {
                    out.push(ch);
                    rest = r;
                }
                Err(_) => {
                    out.push('&');
                    rest = &at[1..];
                }
            }
        }
        out.push_str(rest);
        out
    }

    fn entity(i: &str) -> PResult<'_, char> {
        delimited(char('&'), alt((character_reference, named_entity)), char(';'))(i)
    }

    fn character_reference(i: &str) -> PResult<'_, char> {
        map_opt(
            preceded(
                char('#'),
                alt((
                    preceded(
                        one_of("xX"),
                        map_res(hex_digit1, |h: &str| u32::from_str_radix(h, 16)),
                    ),
                    map_res(digit1, |d: &str| d.parse::<u32>()),
                )),
            ),
            |code: u32| std::char::from_u32(code),
        )(i)
    }

    fn named_entity(i: &str) -> PResult<'_, char> {
        map_opt(alpha1, |name: &str| match name {
            "amp" => Some('&'),
            "lt" => Some('<'),
            "gt" => Some('>'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            "nbsp" => Some('\u{a0}'),
            _ => None,
        })(i)
    }

}

pub mod format {
    use super::model::Node;

    /// Prolog written in front of every stored note.
    pub const ENML_PROLOG: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<!DOCTYPE en-note SYSTEM \"http://xml.evernote.com/pub/enml2.dtd\">\n";

    /// Serialize a node (and its tail) without any prolog.
    pub fn format_node(node: &Node) -> String {
        let mut out = String::new();
        write_node(&mut out, node);
        out
    }

    /// Serialize a note root with the ENML prolog.
    pub fn format_document(root: &Node) -> String {
        let mut out = String::from(ENML_PROLOG);
        write_node(&mut out, root);
        out
    }

    fn write_node(out: &mut String, node: &Node) {
        out.push('<');
        out.push_str(&node.tag);
        for (name, value) in &node.attributes {
            out.push(' ');
            out.push_str(name);
            out.push_str("=\"");
            escape_into(out, value, true);
            out.push('"');
        }
        if node.text.is_empty() && node.children.is_empty() {
            out.push_str("/>");
        } else {
            out.push('>');
            escape_into(out, &node.text, false);
            for child in &node.children {
                write_node(out, child);
            }
            out.push_str("</");
            out.push_str(&node.tag);
            out.push('>');
        }
        escape_into(out, &node.tail, false);
    }

    fn escape_into(out: &mut String, s: &str, attribute: bool) {
        for c in s.chars() {
            match c {
                '&' => out.push_str("&amp;"),
                '<' => out.push_str("&lt;"),
                '>' => out.push_str("&gt;"),
                '"' if attribute => out.push_str("&quot;"),
                '\n' if attribute => out.push_str("&#10;"),
                _ => out.push(c),
            }
        }
    }

}

pub mod storage {
    //! Contract of the note service the rollover runs against.
    //!
    //! The remote service itself lives outside this crate; `dir_store` provides a
    //! directory-backed implementation and tests use in-memory ones.

    use serde::{Deserialize, Serialize};
    use std::path::PathBuf;

    #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct NoteRef {
        pub guid: String,
        pub title: String,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct NotebookRef {
        pub guid: String,
        pub name: String,
    }

    #[derive(Debug, thiserror::Error)]
    pub enum StoreError {
        #[error("note {0:?} not found")]
        NoteNotFound(String),
        #[error("invalid name {0:?}")]
        InvalidName(String),
        #[error("i/o error at {path:?}: {source}")]
        Io {
            path: PathBuf,
            #[source]
            source: std::io::Error,
        },
        #[error("note service error: {0}")]
        Service(String),
    }

    pub trait NoteStore {
        /// Notes carrying `tag`.
        fn find_notes_by_tag(&self, tag: &str) -> Result<Vec<NoteRef>, StoreError>;

        /// Raw markup of a note.
        fn get_note_content(&self, note: &NoteRef) -> Result<String, StoreError>;

        fn update_note_content(&self, note: &NoteRef, content: &str) -> Result<(), StoreError>;

        /// Look a notebook up by name, creating it when missing.
        fn find_or_create_notebook(&self, name: &str) -> Result<NotebookRef, StoreError>;

        fn find_note_by_title(
            &self,
            notebook: &NotebookRef,
            title: &str,
        ) -> Result<Option<NoteRef>, StoreError>;

        fn create_note(
            &self,
            notebook: &NotebookRef,
            title: &str,
            content: &str,
        ) -> Result<(), StoreError>;
    }
}

pub mod dir_store {
    //! Directory-backed note store.
    //!
    //! Layout:
    //! - every `*.enml` file directly under the root is a note; it carries a tag when its
    //!   content contains the tag token,
    //! - a sub-directory is a notebook holding its own `*.enml` notes,
    //! - a note's title is its file stem (path separators in titles become `-`).

    use crate::storage::{NoteRef, NoteStore, NotebookRef, StoreError};
    use std::{
        fs, io,
        path::{Path, PathBuf},
    };
    use tracing::debug;

    pub const NOTE_EXTENSION: &str = "enml";

    #[derive(Debug, Clone)]
    pub struct DirNoteStore {
        root: PathBuf,
    }

    impl DirNoteStore {
        pub fn new(root: impl Into<PathBuf>) -> Self {
            Self { root: root.into() }
        }

        pub fn root(&self) -> &Path {
            &self.root
        }

        fn resolve(&self, guid: &str) -> PathBuf {
            self.root.join(guid)
        }

        fn note_ref(&self, path: &Path, title: String) -> NoteRef {
            let guid = path
                .strip_prefix(&self.root)
                .unwrap_or(path)
                .to_string_lossy()
                .replace('\\', "/");
            NoteRef { guid, title }
        }
    }

    /// File stem (or directory name) used for a title.
    pub fn file_stem_for_title(title: &str) -> String {
        title
            .trim()
            .chars()
            .map(|c| if matches!(c, '/' | '\\' | ':') { '-' } else { c })
            .collect()
    }

    fn io_error(path: &Path) -> impl FnOnce(io::Error) -> StoreError {
        let path = path.to_path_buf();
        move |source| StoreError::Io { path, source }
    }

    fn list_notes(dir: &Path) -> Result<Vec<PathBuf>, StoreError> {
        let mut out = Vec::new();
        for entry in fs::read_dir(dir).map_err(io_error(dir))? {
            let entry = entry.map_err(io_error(dir))?;
            let path = entry.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == NOTE_EXTENSION) {
                out.push(path);
            }
        }
        out.sort();
        Ok(out)
    }

    impl NoteStore for DirNoteStore {
        fn find_notes_by_tag(&self, tag: &str) -> Result<Vec<NoteRef>, StoreError> {
            let mut found = Vec::new();
            for path in list_notes(&self.root)? {
                let content = fs::read_to_string(&path).map_err(io_error(&path))?;
                if !content.contains(tag) {
                    continue;
                }
                let title = path
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default();
                debug!(?path, "note carries tag");
                found.push(self.note_ref(&path, title));
            }
            Ok(found)
        }

        fn get_note_content(&self, note: &NoteRef) -> Result<String, StoreError> {
            let path = self.resolve(&note.guid);
            fs::read_to_string(&path).map_err(|source| {
                if source.kind() == io::ErrorKind::NotFound {
                    StoreError::NoteNotFound(note.guid.clone())
                } else {
                    StoreError::Io {
                        path: path.clone(),
                        source,
                    }
                }
            })
        }

        fn update_note_content(&self, note: &NoteRef, content: &str) -> Result<(), StoreError> {
            let path = self.resolve(&note.guid);
            if !path.is_file() {
                return Err(StoreError::NoteNotFound(note.guid.clone()));
            }
            fs::write(&path, content).map_err(io_error(&path))
        }

        fn find_or_create_notebook(&self, name: &str) -> Result<NotebookRef, StoreError> {
            let dir_name = file_stem_for_title(name);
            if dir_name.is_empty() || dir_name == "." || dir_name == ".." {
                return Err(StoreError::InvalidName(name.to_string()));
            }
            let dir = self.root.join(&dir_name);
            if !dir.is_dir() {
                debug!(?dir, "creating notebook directory");
                fs::create_dir_all(&dir).map_err(io_error(&dir))?;
            }
            Ok(NotebookRef {
                guid: dir_name,
                name: name.to_string(),
            })
        }

        fn find_note_by_title(
            &self,
            notebook: &NotebookRef,
            title: &str,
        ) -> Result<Option<NoteRef>, StoreError> {
            let path = self
                .resolve(&notebook.guid)
                .join(format!("{}.{NOTE_EXTENSION}", file_stem_for_title(title)));
            if path.is_file() {
                Ok(Some(self.note_ref(&path, title.to_string())))
            } else {
                Ok(None)
            }
        }

        fn create_note(
            &self,
            notebook: &NotebookRef,
            title: &str,
            content: &str,
        ) -> Result<(), StoreError> {
            let stem = file_stem_for_title(title);
            if stem.is_empty() {
                return Err(StoreError::InvalidName(title.to_string()));
            }
            let path = self
                .resolve(&notebook.guid)
                .join(format!("{stem}.{NOTE_EXTENSION}"));
            debug!(?path, "creating note");
            fs::write(&path, content).map_err(io_error(&path))
        }
    }

}

pub mod normalize {
    //! Block normalization: split blocks at hard line breaks, then drop trivial wrappers.

    use crate::model::{LINE_BREAK_TAG, Node, WRAPPER_TAG, is_blank};
    use indexmap::IndexMap;

    /// Split every block at its line breaks and collapse trivial wrappers.
    pub fn normalize_blocks(blocks: Vec<Node>) -> Vec<Node> {
        collapse_wrappers(blocks.into_iter().flat_map(split_line_breaks))
    }

    /* --------------------------- Line breaks --------------------------- */

    /// Lines of a block, one sibling node per line.
    ///
    /// Each line keeps the chain of ancestors (tag and attributes) leading to the break, the
    /// break itself stays as the last child of the deepest ancestor of its line, and the
    /// text after a break opens the next line. A block without breaks is yielded unchanged.
    pub fn split_line_breaks(block: Node) -> LineSplitter {
        let mut splitter = LineSplitter {
            untouched: None,
            frames: Vec::new(),
            open: Vec::new(),
        };
        if block.contains_tag(LINE_BREAK_TAG) {
            splitter.enter(block);
        } else {
            splitter.untouched = Some(block);
        }
        splitter
    }

    /// A source element being walked: what is needed to reopen it on a new line.
    struct Frame {
        tag: String,
        attributes: IndexMap<String, String>,
        tail: String,
        children: std::vec::IntoIter<Node>,
    }

    pub struct LineSplitter {
        untouched: Option<Node>,
        /// Source elements from the block down to the one being walked.
        frames: Vec<Frame>,
        /// Clones being filled for the current line, parallel to `frames`.
        open: Vec<Node>,
    }

    impl LineSplitter {
        fn enter(&mut self, node: Node) {
            let Node {
                tag,
                attributes,
                text,
                tail,
                children,
            } = node;
            self.open.push(Node {
                tag: tag.clone(),
                attributes: attributes.clone(),
                text,
                ..Node::default()
            });
            self.frames.push(Frame {
                tag,
                attributes,
                tail,
                children: children.into_iter(),
            });
        }

        /// Fold the open clones into the finished line.
        fn close_line(&mut self) -> Option<Node> {
            while self.open.len() > 1 {
                let child = self.open.pop()?;
                self.open.last_mut()?.children.push(child);
            }
            self.open.pop()
        }

        fn reopen(&mut self, carried: String) {
            for frame in &self.frames {
                self.open.push(Node {
                    tag: frame.tag.clone(),
                    attributes: frame.attributes.clone(),
                    ..Node::default()
                });
            }
            if let Some(deepest) = self.open.last_mut() {
                deepest.text = carried;
            }
        }
    }

    impl Iterator for LineSplitter {
        type Item = Node;

        fn next(&mut self) -> Option<Node> {
            if let Some(node) = self.untouched.take() {
                return Some(node);
            }
            loop {
                let next_child = self.frames.last_mut()?.children.next();
                match next_child {
                    Some(mut marker) if marker.tag == LINE_BREAK_TAG => {
                        let carried = std::mem::take(&mut marker.tail);
                        self.open.last_mut()?.children.push(marker);
                        let line = self.close_line();
                        self.reopen(carried);
                        return line;
                    }
                    Some(child) => self.enter(child),
                    None => {
                        let frame = self.frames.pop()?;
                        let mut clone = self.open.pop()?;
                        clone.tail = frame.tail;
                        match self.open.last_mut() {
                            Some(parent) => parent.children.push(clone),
                            None => return Some(clone),
                        }
                    }
                }
            }
        }
    }

    /* ------------------------- Trivial wrappers ------------------------- */

    /// A `div` holding only `div`s, with no attributes and no text of its own.
    pub fn is_trivial_wrapper(node: &Node) -> bool {
        node.tag == WRAPPER_TAG
            && node.attributes.is_empty()
            && is_blank(&node.text)
            && is_blank(&node.tail)
            && node.children.iter().all(|c| c.tag == WRAPPER_TAG)
    }

    /// Replace trivial wrappers by their children, recursively, keeping order.
    pub fn collapse_wrappers(blocks: impl IntoIterator<Item = Node>) -> Vec<Node> {
        fn rec(block: Node, out: &mut Vec<Node>) {
            if is_trivial_wrapper(&block) {
                for child in block.children {
                    rec(child, out);
                }
            } else {
                out.push(block);
            }
        }
        let mut out = Vec::new();
        for block in blocks {
            rec(block, &mut out);
        }
        out
    }

}

pub mod sections {
    //! Section splitting and task grouping.
    //!
    //! Top-level blocks are bucketed under the last header seen (`start` before any header).
    //! Inside today/later, blocks are grouped into tasks anchored at checklist markers.

    use crate::model::{LIST_ITEM_TAG, Node};
    use crate::normalize::normalize_blocks;
    use indexmap::IndexMap;
    use serde::{Deserialize, Serialize};
    use tracing::debug;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum SectionKind {
        Start,
        Today,
        Later,
        End,
    }

    /// Header text as written in the note, mapped to the section it opens.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct SectionHeaders(IndexMap<String, SectionKind>);

    impl Default for SectionHeaders {
        fn default() -> Self {
            Self::empty()
                .with_header("Today:", SectionKind::Today)
                .with_header("Later:", SectionKind::Later)
                .with_header("Settings:", SectionKind::End)
        }
    }

    impl SectionHeaders {
        pub fn empty() -> Self {
            Self(IndexMap::new())
        }

        pub fn with_header(mut self, text: impl Into<String>, kind: SectionKind) -> Self {
            self.0.insert(text.into(), kind);
            self
        }

        pub fn lookup(&self, text: &str) -> Option<SectionKind> {
            self.0.get(text).copied()
        }

        /// Section opened by `block` if it is a header: its whole text is a header string,
        /// it is emphasized and it is not a checklist item.
        pub fn section_of(&self, block: &Node) -> Option<SectionKind> {
            let kind = self.lookup(block.text_content().trim())?;
            if block.starts_checklist() || !block.has_emphasis() {
                return None;
            }
            Some(kind)
        }
    }

    /// One checklist item and the blocks that follow it up to the next item.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct TaskGroup {
        pub blocks: Vec<Node>,
        pub completed: bool,
    }

    impl TaskGroup {
        pub fn text_content(&self) -> String {
            self.blocks.iter().map(Node::text_content).collect()
        }
    }

    /// Pending content of today or later.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct Bucket {
        /// Blocks before the first checklist item, the header among them.
        pub leading: Vec<Node>,
        pub tasks: Vec<TaskGroup>,
    }

    impl Bucket {
        pub fn into_blocks(self) -> impl Iterator<Item = Node> {
            self.leading
                .into_iter()
                .chain(self.tasks.into_iter().flat_map(|t| t.blocks))
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Default)]
    pub struct Sections {
        pub start: Vec<Node>,
        pub today: Bucket,
        pub later: Bucket,
        pub end: Vec<Node>,
        pub settings: IndexMap<String, String>,
        /// Completed tasks of today, then of later.
        pub completed: Vec<TaskGroup>,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Default)]
    pub struct GroupedTasks {
        pub leading: Vec<Node>,
        pub pending: Vec<TaskGroup>,
        pub completed: Vec<TaskGroup>,
    }

    impl GroupedTasks {
        fn flush(&mut self, blocks: Vec<Node>, in_task: bool, completed: bool) {
            if blocks.is_empty() {
                return;
            }
            if !in_task {
                self.leading = blocks;
            } else if completed {
                self.completed.push(TaskGroup {
                    blocks,
                    completed: true,
                });
            } else {
                self.pending.push(TaskGroup {
                    blocks,
                    completed: false,
                });
            }
        }
    }

    /// Normalize the root's children and bucket them into sections.
    pub fn split_into_sections(blocks: Vec<Node>, headers: &SectionHeaders) -> Sections {
        let mut start = Vec::new();
        let mut today = Vec::new();
        let mut later = Vec::new();
        let mut end = Vec::new();
        let mut settings = IndexMap::new();
        let mut current = SectionKind::Start;

        for block in normalize_blocks(blocks) {
            if let Some(kind) = headers.section_of(&block) {
                debug!(?kind, "section header");
                current = kind;
            }
            let target = match current {
                SectionKind::Start => &mut start,
                SectionKind::Today => &mut today,
                SectionKind::Later => &mut later,
                SectionKind::End => {
                    harvest_settings(&block, &mut settings);
                    &mut end
                }
            };
            target.push(block);
        }

        let today = split_to_tasks(today);
        let later = split_to_tasks(later);
        let mut completed = today.completed;
        completed.extend(later.completed);

        Sections {
            start,
            today: Bucket {
                leading: today.leading,
                tasks: today.pending,
            },
            later: Bucket {
                leading: later.leading,
                tasks: later.pending,
            },
            end,
            settings,
            completed,
        }
    }

    /// Group blocks into tasks; a block holding a checklist marker starts a new one.
    pub fn split_to_tasks(blocks: Vec<Node>) -> GroupedTasks {
        let mut out = GroupedTasks::default();
        let mut current = Vec::new();
        let mut in_task = false;
        let mut completed = false;
        for block in blocks {
            if block.starts_checklist() {
                out.flush(std::mem::take(&mut current), in_task, completed);
                in_task = true;
                completed = block.is_checked();
            }
            current.push(block);
        }
        out.flush(current, in_task, completed);
        out
    }

    /// `key: value`, split on the first colon; the value may hold further colons.
    pub fn parse_setting(text: &str) -> Option<(String, String)> {
        let (key, value) = text.trim().split_once(':')?;
        let key = key.trim();
        if key.is_empty() {
            return None;
        }
        Some((key.to_string(), value.trim().to_string()))
    }

    fn harvest_settings(block: &Node, settings: &mut IndexMap<String, String>) {
        for item in block.find_all(LIST_ITEM_TAG) {
            let text = item.text_content();
            match parse_setting(&text) {
                Some((key, value)) => {
                    settings.insert(key, value);
                }
                None => debug!(item = text.trim(), "skipping list item without a key"),
            }
        }
    }

}

pub mod dates {
    //! Due-date tokens (`@due:<value>`) and history note titles.

    use crate::model::{DateFormat, Node, Periodicity};
    use chrono::{Datelike, Duration, Months, NaiveDate};
    use indexmap::IndexMap;
    use regex::Regex;
    use serde::{Deserialize, Serialize};
    use std::sync::LazyLock;
    use tracing::debug;

    pub const DUE_PREFIX: &str = "@due:";

    /// `@due:<value>`; the value stops at whitespace and at any bracket.
    pub(crate) static DUE_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"@due:([^\[\] \t\n(){}]+)").expect("due token pattern compiles")
    });

    /// Symbolic due values (`@due:tomorrow`) and the dates they stand for in one run.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct DateAliases(IndexMap<String, NaiveDate>);

    impl DateAliases {
        pub fn new() -> Self {
            Self(IndexMap::new())
        }

        /// `today`, `tomorrow` and `yesterday` around `today`.
        pub fn standard(today: NaiveDate) -> Self {
            let mut aliases = Self::new();
            aliases.insert("today", today);
            aliases.insert("tomorrow", today + Duration::days(1));
            aliases.insert("yesterday", today - Duration::days(1));
            aliases
        }

        pub fn insert(&mut self, name: impl Into<String>, date: NaiveDate) -> Option<NaiveDate> {
            self.0.insert(name.into(), date)
        }

        pub fn get(&self, name: &str) -> Option<NaiveDate> {
            self.0.get(name).copied()
        }
    }

    /// Value of the first due token in `text`.
    pub fn find_due_token(text: &str) -> Option<&str> {
        DUE_TOKEN
            .captures(text)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str())
    }

    pub fn resolve_due_value(
        value: &str,
        aliases: &DateAliases,
        date_format: &DateFormat,
    ) -> Option<NaiveDate> {
        aliases.get(value).or_else(|| date_format.read(value))
    }

    /// Due date of a task: the last resolvable token in block order, else `default`.
    pub fn resolve_due_date(
        blocks: &[Node],
        default: NaiveDate,
        aliases: &DateAliases,
        date_format: &DateFormat,
    ) -> NaiveDate {
        let mut due = default;
        for block in blocks {
            let text = block.text_content();
            let Some(value) = find_due_token(&text) else {
                continue;
            };
            match resolve_due_value(value, aliases, date_format) {
                Some(date) => due = date,
                None => debug!(token = value, "ignoring unresolvable due date"),
            }
        }
        due
    }

    pub fn due_token(date: NaiveDate, date_format: &DateFormat, separator: &str) -> String {
        format!("{DUE_PREFIX}{}", date_format.render(date, separator))
    }

    /// Monday and Sunday of the week holding `date`.
    pub fn week_bounds(date: NaiveDate) -> (NaiveDate, NaiveDate) {
        let monday = date - Duration::days(i64::from(date.weekday().num_days_from_monday()));
        (monday, monday + Duration::days(6))
    }

    /// First and last day of the month holding `date`.
    pub fn month_bounds(date: NaiveDate) -> (NaiveDate, NaiveDate) {
        let first = date - Duration::days(i64::from(date.day0()));
        let last = first
            .checked_add_months(Months::new(1))
            .and_then(|d| d.pred_opt())
            .unwrap_or(first);
        (first, last)
    }

    /// Title of the history note that covers `date`.
    pub fn history_title(
        prefix: &str,
        date: NaiveDate,
        periodicity: Periodicity,
        date_format: &DateFormat,
        separator: &str,
    ) -> String {
        let render = |d: NaiveDate| date_format.render(d, separator);
        match periodicity {
            Periodicity::Daily => format!("{prefix} ({})", render(date)),
            Periodicity::Weekly => {
                let (monday, sunday) = week_bounds(date);
                format!("{prefix} ({} - {})", render(monday), render(sunday))
            }
            Periodicity::Monthly => {
                let (first, last) = month_bounds(date);
                format!("{prefix} ({} - {})", render(first), render(last))
            }
        }
    }

}

pub mod projectors {
    pub mod rollover_projector {
        //! Rolls pending tasks across the day boundary and rebuilds the note.
        //!
        //! Tasks due by tomorrow end up under today in their original order; the rest go
        //! under later sorted by due date. Every task's due token is rewritten to its
        //! resolved date so the next run reads the same schedule.

        use crate::dates::{self, DUE_TOKEN, DateAliases};
        use crate::model::{LINE_BREAK_TAG, Node, RolloverError, RunId, Settings};
        use crate::sections::{
            Bucket, SectionHeaders, SectionKind, Sections, TaskGroup, split_into_sections,
        };
        use chrono::{Duration, NaiveDate};
        use regex::NoExpand;
        use serde::{Deserialize, Serialize};
        use tracing::debug;

        /// A pending task with its resolved due date and the bucket it was read from.
        #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
        pub struct ScheduledTask {
            pub due: NaiveDate,
            pub origin: SectionKind,
            pub group: TaskGroup,
        }

        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
        pub struct RolloverStats {
            pub today: usize,
            pub later: usize,
            pub completed: usize,
            /// Later tasks that became due.
            pub pulled_into_today: usize,
            /// Today tasks whose due date moved past tomorrow.
            pub pushed_to_later: usize,
        }

        #[derive(Debug, Clone)]
        pub struct RunResult {
            pub run_id: RunId,
            pub updated_root: Node,
            /// Blocks of every completed task, one entry per task.
            pub history_fragments: Vec<Vec<Node>>,
            pub history_title: String,
            pub notebook_name: String,
            pub settings: Settings,
            pub stats: RolloverStats,
        }

        /// Roll the note over with the default section headers.
        pub fn run(
            root: Node,
            today: NaiveDate,
            aliases: &DateAliases,
        ) -> Result<RunResult, RolloverError> {
            run_with_headers(root, today, aliases, &SectionHeaders::default())
        }

        pub fn run_with_headers(
            root: Node,
            today: NaiveDate,
            aliases: &DateAliases,
            headers: &SectionHeaders,
        ) -> Result<RunResult, RolloverError> {
            let run_id = RunId::new();
            let Node {
                tag,
                attributes,
                text,
                tail,
                children,
            } = root;
            let shell = Node {
                tag,
                attributes,
                text,
                tail,
                children: Vec::new(),
            };

            let sections = split_into_sections(children, headers);
            let settings = Settings::from_map(&sections.settings)?;
            let tomorrow = today + Duration::days(1);

            let Sections {
                start,
                today: today_bucket,
                later: later_bucket,
                end,
                completed,
                ..
            } = sections;
            let Bucket {
                leading: today_leading,
                tasks: today_tasks,
            } = today_bucket;
            let Bucket {
                leading: later_leading,
                tasks: later_tasks,
            } = later_bucket;

            let mut scheduled = schedule(
                today_tasks,
                SectionKind::Today,
                today,
                aliases,
                &settings,
            );
            scheduled.extend(schedule(
                later_tasks,
                SectionKind::Later,
                tomorrow,
                aliases,
                &settings,
            ));

            let (due_soon, due_later) = plan_rollover(scheduled, tomorrow);
            let stats = RolloverStats {
                today: due_soon.len(),
                later: due_later.len(),
                completed: completed.len(),
                pulled_into_today: due_soon
                    .iter()
                    .filter(|t| t.origin == SectionKind::Later)
                    .count(),
                pushed_to_later: due_later
                    .iter()
                    .filter(|t| t.origin == SectionKind::Today)
                    .count(),
            };
            debug!(%run_id, ?stats, "rollover planned");

            let today_bucket = Bucket {
                leading: today_leading,
                tasks: annotate_all(due_soon, &settings, headers),
            };
            let later_bucket = Bucket {
                leading: later_leading,
                tasks: annotate_all(due_later, &settings, headers),
            };
            let updated_root = reassemble(shell, start, today_bucket, later_bucket, end);

            let history_title = dates::history_title(
                &settings.history_note,
                today,
                settings.history_interval,
                &settings.date_format,
                &settings.date_separator,
            );

            Ok(RunResult {
                run_id,
                updated_root,
                history_fragments: completed.into_iter().map(|t| t.blocks).collect(),
                history_title,
                notebook_name: settings.history_notebook.clone(),
                settings,
                stats,
            })
        }

        fn schedule(
            tasks: Vec<TaskGroup>,
            origin: SectionKind,
            default: NaiveDate,
            aliases: &DateAliases,
            settings: &Settings,
        ) -> Vec<ScheduledTask> {
            tasks
                .into_iter()
                .map(|group| ScheduledTask {
                    due: dates::resolve_due_date(
                        &group.blocks,
                        default,
                        aliases,
                        &settings.date_format,
                    ),
                    origin,
                    group,
                })
                .collect()
        }

        /// Split at `tomorrow`: due by then keeps input order, the rest is sorted by due
        /// date (stable, so ties keep input order).
        pub fn plan_rollover(
            tasks: Vec<ScheduledTask>,
            tomorrow: NaiveDate,
        ) -> (Vec<ScheduledTask>, Vec<ScheduledTask>) {
            let (soon, mut later): (Vec<_>, Vec<_>) =
                tasks.into_iter().partition(|t| t.due <= tomorrow);
            later.sort_by_key(|t| t.due);
            (soon, later)
        }

        fn annotate_all(
            tasks: Vec<ScheduledTask>,
            settings: &Settings,
            headers: &SectionHeaders,
        ) -> Vec<TaskGroup> {
            tasks
                .into_iter()
                .map(|mut task| {
                    annotate_task(&mut task, settings, headers);
                    task.group
                })
                .collect()
        }

        /// Write the task's due date back into its text.
        ///
        /// The first text field holding a token is rewritten; without any token one is
        /// appended to the first block, unless that block is a section header.
        pub fn annotate_task(
            task: &mut ScheduledTask,
            settings: &Settings,
            headers: &SectionHeaders,
        ) {
            let token =
                dates::due_token(task.due, &settings.date_format, &settings.date_separator);
            if task
                .group
                .blocks
                .iter_mut()
                .any(|block| replace_due_token(block, &token))
            {
                return;
            }
            let Some(first) = task.group.blocks.first_mut() else {
                return;
            };
            if headers.section_of(first).is_some() {
                return;
            }
            // A trailing break ends the line; the token goes in front of it.
            let appended = format!(" {token} ");
            match first
                .children
                .iter_mut()
                .rev()
                .find(|child| child.tag != LINE_BREAK_TAG)
            {
                Some(last) => last.tail.push_str(&appended),
                None => first.text.push_str(&appended),
            }
        }

        /// Replace the tokens of the first text or tail (document order) that has any.
        pub fn replace_due_token(node: &mut Node, token: &str) -> bool {
            if rewrite_field(&mut node.text, token) {
                return true;
            }
            if node
                .children
                .iter_mut()
                .any(|child| replace_due_token(child, token))
            {
                return true;
            }
            rewrite_field(&mut node.tail, token)
        }

        fn rewrite_field(field: &mut String, token: &str) -> bool {
            if !DUE_TOKEN.is_match(field.as_str()) {
                return false;
            }
            *field = DUE_TOKEN
                .replace_all(field.as_str(), NoExpand(token))
                .into_owned();
            true
        }

        /// Root with its own tag/attributes/text/tail and the sections in fixed order.
        pub fn reassemble(
            mut shell: Node,
            start: Vec<Node>,
            today: Bucket,
            later: Bucket,
            end: Vec<Node>,
        ) -> Node {
            shell.children = start
                .into_iter()
                .chain(today.into_blocks())
                .chain(later.into_blocks())
                .chain(end)
                .collect();
            shell
        }

        #[cfg(test)]
        mod tests {
            use super::*;
            use crate::format::format_node;
            use crate::model::RolloverError;
            use crate::parser::parse_document;

            fn date(y: i32, m: u32, d: u32) -> NaiveDate {
                NaiveDate::from_ymd_opt(y, m, d).unwrap()
            }

            const SETTINGS: &str = concat!(
                "<div><strong>Settings:</strong></div>",
                "<ul><li>Date format: dmy</li><li>Date separator: /</li>",
                "<li>History notebook: Journal</li><li>History interval: monthly</li>",
                "<li>History note: Done</li></ul>"
            );

            fn note(today: &str, later: &str) -> Node {
                let markup = format!(
                    "<en-note style=\"s\">top<div>Intro</div><div><strong>Today:</strong></div>{today}<div><b>Later:</b></div>{later}{SETTINGS}</en-note>"
                );
                parse_document(&markup).expect("note parses")
            }

            fn task_texts(root: &Node, from: &str, to: &str) -> Vec<String> {
                let texts: Vec<String> = root.children.iter().map(Node::text_content).collect();
                let start = texts.iter().position(|t| t == from).expect("from header") + 1;
                let end = texts.iter().position(|t| t == to).expect("to header");
                texts[start..end].to_vec()
            }

            #[test]
            fn moves_tasks_across_the_threshold() {
                let root = note(
                    "<div><en-todo/>A @due:9/3/2024</div>",
                    "<div><en-todo/>C @due:15/3/2024</div><div><en-todo/>B @due:11/3/2024</div>",
                );
                let today = date(2024, 3, 10);
                let result = run(root, today, &DateAliases::standard(today)).expect("run");

                assert_eq!(
                    task_texts(&result.updated_root, "Today:", "Later:"),
                    vec!["A @due:9/3/2024", "B @due:11/3/2024"]
                );
                assert_eq!(
                    task_texts(&result.updated_root, "Later:", "Settings:"),
                    vec!["C @due:15/3/2024"]
                );
                assert_eq!(
                    result.stats,
                    RolloverStats {
                        today: 2,
                        later: 1,
                        completed: 0,
                        pulled_into_today: 1,
                        pushed_to_later: 0,
                    }
                );
            }

            #[test]
            fn rewrites_aliases_and_appends_missing_tokens() {
                let root = note(
                    "<div><en-todo/>A @due:tomorrow</div><div><en-todo/>B</div><div><en-todo/><i>C</i></div>",
                    "<div><en-todo/>D</div><div><en-todo/>E @due:next-week</div><div>E note @due:20/3/2024</div>",
                );
                let today = date(2024, 3, 10);
                let result = run(root, today, &DateAliases::standard(today)).expect("run");

                assert_eq!(
                    task_texts(&result.updated_root, "Today:", "Later:"),
                    vec![
                        "A @due:11/3/2024",
                        "B @due:10/3/2024 ",
                        "C @due:10/3/2024 ",
                        "D @due:11/3/2024 ",
                    ]
                );
                // The unresolvable token is rewritten in place; the note keeps its own.
                assert_eq!(
                    task_texts(&result.updated_root, "Later:", "Settings:"),
                    vec!["E @due:20/3/2024", "E note @due:20/3/2024"]
                );
                let c_block = &result.updated_root.children[4];
                assert_eq!(
                    format_node(c_block),
                    "<div><en-todo/><i>C</i> @due:10/3/2024 </div>"
                );
            }

            #[test]
            fn pushes_far_tasks_to_later_sorted_and_stable() {
                let root = note(
                    "<div><en-todo/>X @due:20/3/2024</div><div><en-todo/>Y @due:12/3/2024</div>",
                    "<div><en-todo/>Z @due:12/3/2024</div><div><en-todo/>W @due:1/3/2024</div>",
                );
                let today = date(2024, 3, 10);
                let result = run(root, today, &DateAliases::standard(today)).expect("run");
                assert_eq!(
                    task_texts(&result.updated_root, "Today:", "Later:"),
                    vec!["W @due:1/3/2024"]
                );
                assert_eq!(
                    task_texts(&result.updated_root, "Later:", "Settings:"),
                    vec!["Y @due:12/3/2024", "Z @due:12/3/2024", "X @due:20/3/2024"]
                );
                assert_eq!(result.stats.pushed_to_later, 2);
            }

            #[test]
            fn keeps_root_shell_and_section_order() {
                let root = note(
                    "<div><en-todo checked=\"true\"/>Done today</div><div>with a note</div>",
                    "<div><en-todo/>Open</div>",
                );
                let today = date(2024, 3, 10);
                let result = run(root, today, &DateAliases::standard(today)).expect("run");
                let out = &result.updated_root;
                assert_eq!(out.tag, "en-note");
                assert_eq!(out.attributes["style"], "s");
                assert_eq!(out.text, "top");
                let texts: Vec<String> = out.children.iter().map(Node::text_content).collect();
                assert_eq!(texts[..4], ["Intro", "Today:", "Open @due:11/3/2024 ", "Later:"]);
                assert_eq!(texts[4], "Settings:");

                assert_eq!(result.history_fragments.len(), 1);
                assert_eq!(
                    result.history_fragments[0]
                        .iter()
                        .map(Node::text_content)
                        .collect::<Vec<_>>(),
                    vec!["Done today", "with a note"]
                );
                assert_eq!(result.history_title, "Done (1/3/2024 - 31/3/2024)");
                assert_eq!(result.notebook_name, "Journal");
                assert_eq!(result.stats.completed, 1);
            }

            #[test]
            fn plan_sorts_only_the_later_side() {
                let task = |day: u32, name: &str| ScheduledTask {
                    due: date(2024, 3, day),
                    origin: SectionKind::Today,
                    group: TaskGroup {
                        blocks: vec![Node::new("div").with_text(name)],
                        completed: false,
                    },
                };
                let tasks = vec![
                    task(11, "b"),
                    task(15, "c"),
                    task(9, "a"),
                    task(12, "d"),
                    task(12, "e"),
                ];
                let (soon, later) = plan_rollover(tasks, date(2024, 3, 11));
                let names = |v: &[ScheduledTask]| {
                    v.iter()
                        .map(|t| t.group.text_content())
                        .collect::<Vec<_>>()
                };
                assert_eq!(names(&soon), vec!["b", "a"]);
                assert_eq!(names(&later), vec!["d", "e", "c"]);
            }

            #[test]
            fn only_the_first_matching_field_is_rewritten() {
                let mut block = parse_document(
                    "<div><en-todo/>a @due:1/1/2024 and @due:2/1/2024<i>b @due:today</i></div>",
                )
                .unwrap();
                assert!(replace_due_token(&mut block, "@due:5/5/2024"));
                assert_eq!(
                    block.text_content(),
                    "a @due:5/5/2024 and @due:5/5/2024b @due:today"
                );
                let mut plain = Node::new("div").with_text("no token");
                assert!(!replace_due_token(&mut plain, "@due:5/5/2024"));
            }

            #[test]
            fn appended_token_stays_in_front_of_a_trailing_break() {
                let root = note("<div><en-todo/>F<br/>more about F</div>", "");
                let today = date(2024, 3, 10);
                let result = run(root, today, &DateAliases::standard(today)).expect("run");
                assert_eq!(
                    format_node(&result.updated_root.children[2]),
                    "<div><en-todo/>F @due:10/3/2024 <br/></div>"
                );
                assert_eq!(
                    result.updated_root.children[3].text_content(),
                    "more about F"
                );
            }

            #[test]
            fn colon_works_as_date_separator() {
                let markup = format!(
                    "<en-note><div><b>Today:</b></div><div><en-todo/>A @due:12:3:2024</div><div><en-todo/>B</div>{}</en-note>",
                    SETTINGS.replace("Date separator: /", "Date separator: :")
                );
                let root = parse_document(&markup).expect("note parses");
                let today = date(2024, 3, 10);
                let result = run(root, today, &DateAliases::standard(today)).expect("run");
                assert_eq!(result.settings.date_separator, ":");
                assert_eq!(
                    task_texts(&result.updated_root, "Today:", "Settings:"),
                    vec!["B @due:10:3:2024 ", "A @due:12:3:2024"]
                );
                assert_eq!(result.history_title, "Done (1:3:2024 - 31:3:2024)");
            }

            #[test]
            fn header_blocks_never_receive_tokens() {
                let settings = Settings::from_map(
                    &[
                        ("Date format", "dmy"),
                        ("Date separator", "/"),
                        ("History notebook", "n"),
                        ("History interval", "daily"),
                        ("History note", "h"),
                    ]
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect::<indexmap::IndexMap<String, String>>(),
                )
                .unwrap();
                let header = parse_document("<div><b>Today:</b></div>").unwrap();
                let mut task = ScheduledTask {
                    due: date(2024, 3, 10),
                    origin: SectionKind::Today,
                    group: TaskGroup {
                        blocks: vec![header.clone()],
                        completed: false,
                    },
                };
                annotate_task(&mut task, &settings, &SectionHeaders::default());
                assert_eq!(task.group.blocks, vec![header]);
            }

            #[test]
            fn settings_errors_abort_the_run() {
                let missing = parse_document(
                    "<en-note><div><b>Settings:</b></div><ul><li>Date format: dmy</li></ul></en-note>",
                )
                .unwrap();
                let today = date(2024, 3, 10);
                let err = run(missing, today, &DateAliases::standard(today)).unwrap_err();
                assert!(matches!(err, RolloverError::MissingSetting(ref k) if k == "Date separator"));

                let bad_format = parse_document(&format!(
                    "<en-note>{}</en-note>",
                    SETTINGS.replace("Date format: dmy", "Date format: dd")
                ))
                .unwrap();
                let err = run(bad_format, today, &DateAliases::standard(today)).unwrap_err();
                assert!(matches!(err, RolloverError::InvalidDateFormat(ref v) if v == "dd"));
            }
        }
    }

    pub mod history_projector {
        //! Builds the history note entry for completed tasks.

        use crate::model::{Node, ROOT_TAG, Settings, WRAPPER_TAG};
        use chrono::NaiveDate;

        /// `<div><strong>{date}</strong></div>`, opening one day of the history.
        pub fn day_heading(date: NaiveDate, settings: &Settings) -> Node {
            Node::new(WRAPPER_TAG).with_child(Node::new("strong").with_text(settings.render_date(date)))
        }

        /// Append the day heading and the completed task blocks to a history note root,
        /// starting a fresh note when there is none yet. The heading is written even when
        /// nothing was completed.
        pub fn append_history(
            existing: Option<Node>,
            date: NaiveDate,
            settings: &Settings,
            fragments: Vec<Vec<Node>>,
        ) -> Node {
            let mut root = existing.unwrap_or_else(|| Node::new(ROOT_TAG));
            root.children.push(day_heading(date, settings));
            root.children.extend(fragments.into_iter().flatten());
            root
        }

    }
}

pub mod service {
    //! Runs the rollover over every tagged note of a store and archives completed tasks.
    //!
    //! A failing note never aborts the batch: the failure is recorded with the stage it
    //! happened in and the next note is processed.

    use crate::dates::DateAliases;
    use crate::format::format_document;
    use crate::model::{Node, RunId, Settings};
    use crate::parser::parse_document;
    use crate::projectors::history_projector;
    use crate::projectors::rollover_projector::{self, RolloverStats, RunResult};
    use crate::sections::SectionHeaders;
    use crate::storage::{NoteRef, NoteStore, StoreError};
    use chrono::NaiveDate;
    use serde::{Deserialize, Serialize};
    use std::fmt;
    use tracing::{debug, field, info, info_span, warn};

    pub const DEFAULT_TAG: &str = "@smarttodo";

    type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct RolloverOptions {
        /// Notes carrying this tag are rolled over.
        pub tag: String,
        pub headers: SectionHeaders,
        /// Compute everything, write nothing.
        pub dry_run: bool,
    }

    impl Default for RolloverOptions {
        fn default() -> Self {
            Self {
                tag: DEFAULT_TAG.to_string(),
                headers: SectionHeaders::default(),
                dry_run: false,
            }
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
    #[serde(rename_all = "lowercase")]
    pub enum Stage {
        Fetch,
        Parse,
        Rollover,
        Store,
        History,
    }

    impl fmt::Display for Stage {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let s = match self {
                Stage::Fetch => "fetch",
                Stage::Parse => "parse",
                Stage::Rollover => "rollover",
                Stage::Store => "store",
                Stage::History => "history",
            };
            f.write_str(s)
        }
    }

    #[derive(Debug, thiserror::Error)]
    #[error("note {note:?} failed during {stage}: {source}")]
    pub struct DocumentError {
        pub note: String,
        pub stage: Stage,
        #[source]
        pub source: BoxError,
    }

    impl DocumentError {
        fn at<E: Into<BoxError>>(note: &NoteRef, stage: Stage) -> impl FnOnce(E) -> Self {
            let note = note.title.clone();
            move |source| Self {
                note,
                stage,
                source: source.into(),
            }
        }
    }

    #[derive(Debug, Clone, Serialize)]
    pub struct NoteReport {
        pub run_id: RunId,
        pub note: NoteRef,
        pub history_title: String,
        pub history_notebook: String,
        /// A new history note was started by this run.
        pub history_created: bool,
        pub stats: RolloverStats,
        pub dry_run: bool,
    }

    #[derive(Debug, Default)]
    pub struct BatchReport {
        pub processed: Vec<NoteReport>,
        pub failures: Vec<DocumentError>,
    }

    impl BatchReport {
        pub fn is_success(&self) -> bool {
            self.failures.is_empty()
        }
    }

    /// Roll over every note carrying `options.tag`.
    ///
    /// Only the initial search can fail the whole batch.
    pub fn process_tagged<S: NoteStore + ?Sized>(
        store: &S,
        today: NaiveDate,
        options: &RolloverOptions,
    ) -> Result<BatchReport, StoreError> {
        let notes = store.find_notes_by_tag(&options.tag)?;
        info!(tag = %options.tag, count = notes.len(), "found tagged notes");

        let mut report = BatchReport::default();
        for note in notes {
            match process_note(store, &note, today, options) {
                Ok(done) => report.processed.push(done),
                Err(err) => {
                    warn!(note = %err.note, stage = %err.stage, error = %err.source, "note skipped");
                    report.failures.push(err);
                }
            }
        }
        Ok(report)
    }

    /// Roll over one note and append its completed tasks to the history note.
    pub fn process_note<S: NoteStore + ?Sized>(
        store: &S,
        note: &NoteRef,
        today: NaiveDate,
        options: &RolloverOptions,
    ) -> Result<NoteReport, DocumentError> {
        let span = info_span!("note", note = %note.title, run_id = field::Empty);
        let _guard = span.enter();

        let content = store
            .get_note_content(note)
            .map_err(DocumentError::at(note, Stage::Fetch))?;
        let root = parse_document(&content).map_err(DocumentError::at(note, Stage::Parse))?;

        let aliases = DateAliases::standard(today);
        let RunResult {
            run_id,
            updated_root,
            history_fragments,
            history_title,
            notebook_name,
            settings,
            stats,
        } = rollover_projector::run_with_headers(root, today, &aliases, &options.headers)
            .map_err(DocumentError::at(note, Stage::Rollover))?;

        span.record("run_id", field::display(run_id));
        debug!(?stats, "rolled over");

        // Completed tasks leave the note only once they are in the history.
        let mut history_created = false;
        if options.dry_run {
            info!(%history_title, "dry run, nothing written");
        } else {
            history_created = archive(
                store,
                today,
                &settings,
                &notebook_name,
                &history_title,
                history_fragments,
            )
            .map_err(DocumentError::at(note, Stage::History))?;
            store
                .update_note_content(note, &format_document(&updated_root))
                .map_err(DocumentError::at(note, Stage::Store))?;
            info!(%history_title, history_created, "note updated");
        }

        Ok(NoteReport {
            run_id,
            note: note.clone(),
            history_title,
            history_notebook: notebook_name,
            history_created,
            stats,
            dry_run: options.dry_run,
        })
    }

    /// Returns whether a new history note was created.
    fn archive<S: NoteStore + ?Sized>(
        store: &S,
        today: NaiveDate,
        settings: &Settings,
        notebook_name: &str,
        title: &str,
        fragments: Vec<Vec<Node>>,
    ) -> Result<bool, BoxError> {
        let notebook = store.find_or_create_notebook(notebook_name)?;
        match store.find_note_by_title(&notebook, title)? {
            Some(history) => {
                let existing = parse_document(&store.get_note_content(&history)?)?;
                let root =
                    history_projector::append_history(Some(existing), today, settings, fragments);
                store.update_note_content(&history, &format_document(&root))?;
                Ok(false)
            }
            None => {
                let root = history_projector::append_history(None, today, settings, fragments);
                store.create_note(&notebook, title, &format_document(&root))?;
                Ok(true)
            }
        }
    }

}

pub use format::{format_document, format_node};
pub use parser::parse_document;
pub use projectors::rollover_projector::{RunResult, run};
