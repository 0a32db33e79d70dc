// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reads the CI server's on-disk user records to confirm that the accounts
//! and tokens it was asked to create were actually persisted.

// The general idea here is to stream in elements looking for a hierarchy of
// tags and collect the text inside the innermost one. The user-id mapping
// file looks like this:
//
// <hudson.model.UserIdMapper>
//   <idToDirectoryNameMap class="concurrent-hash-map">
//     <entry>
//       <string>admin</string>                 <-- user id
//       <string>admin_8452935468239187</string> <-- its directory
//     </entry>
//
// and a user's config.xml holds its API tokens:
//
// <user>
//   <properties>
//     <jenkins.security.ApiTokenProperty>
//       <tokenStore>
//         <tokenList>
//           <jenkins.security.apitoken.ApiTokenStore_-HashedToken>
//             <name>provisioner</name>          <-- token name
//
// Intermediate elements that aren't part of a rule may appear between the
// ones that are.

use std::collections::BTreeMap;

use anyhow::Context as _;
use itertools::Itertools;

/// The element names, outermost first, under which to collect text.
struct CollectRule {
    elements: Vec<&'static str>,
}

impl CollectRule {
    fn new(elements: &[&'static str]) -> Self {
        Self { elements: elements.to_vec() }
    }

    fn is_armed(&self, depth: usize) -> bool {
        depth == self.elements.len()
    }

    /// Returns the text of every element matching this rule, in document
    /// order.
    fn collect<R: std::io::Read>(
        &self,
        input: xml::EventReader<R>,
    ) -> anyhow::Result<Vec<String>> {
        let mut depth = 0;
        let mut found = Vec::new();
        let mut current: Option<String> = None;

        for event in input {
            match event.context("parsing CI server XML")? {
                xml::reader::XmlEvent::StartElement { name, .. } => {
                    if !self.is_armed(depth)
                        && self.elements[depth] == name.local_name
                    {
                        depth += 1;
                        if self.is_armed(depth) {
                            current = Some(String::new());
                        }
                    }
                }
                xml::reader::XmlEvent::EndElement { name } => {
                    // If this is the end of the most-recently-matched element,
                    // move back one element.
                    if depth > 0 && self.elements[depth - 1] == name.local_name
                    {
                        if self.is_armed(depth) {
                            if let Some(text) = current.take() {
                                found.push(text.trim().to_string());
                            }
                        }
                        depth -= 1;
                    }
                }
                xml::reader::XmlEvent::Characters(data)
                | xml::reader::XmlEvent::CData(data) => {
                    if let Some(text) = current.as_mut() {
                        text.push_str(&data);
                    }
                }
                _ => {}
            }
        }

        Ok(found)
    }
}

/// Maps each user id in the CI server's `users.xml` to its directory name.
pub fn user_directories(
    users_xml: &str,
) -> anyhow::Result<BTreeMap<String, String>> {
    let rule = CollectRule::new(&["idToDirectoryNameMap", "entry", "string"]);
    let strings = rule
        .collect(xml::EventReader::new(users_xml.as_bytes()))
        .context("reading the user id mapping")?;

    Ok(strings.into_iter().tuples().collect())
}

/// Lists the names of the API tokens in a user's `config.xml`.
pub fn api_token_names(user_config_xml: &str) -> anyhow::Result<Vec<String>> {
    let rule = CollectRule::new(&["tokenStore", "tokenList", "name"]);
    rule.collect(xml::EventReader::new(user_config_xml.as_bytes()))
        .context("reading the user's API tokens")
}

#[cfg(test)]
mod test {
    use super::*;

    const USERS_XML: &str = r#"<?xml version='1.1' encoding='UTF-8'?>
<hudson.model.UserIdMapper>
  <version>1</version>
  <idToDirectoryNameMap class="concurrent-hash-map">
    <entry>
      <string>admin</string>
      <string>admin_8452935468239187</string>
    </entry>
    <entry>
      <string>ops</string>
      <string>ops_1190345812</string>
    </entry>
  </idToDirectoryNameMap>
</hudson.model.UserIdMapper>
"#;

    const USER_CONFIG_XML: &str = r#"<?xml version='1.1' encoding='UTF-8'?>
<user>
  <version>10</version>
  <id>admin</id>
  <fullName>admin</fullName>
  <properties>
    <jenkins.security.ApiTokenProperty>
      <tokenStore>
        <tokenList>
          <jenkins.security.apitoken.ApiTokenStore_-HashedToken>
            <uuid>5b0b5d8a-7c3c-4f8e-9e53-0b2f0b7f3f51</uuid>
            <name>provisioner</name>
            <creationDate>2024-10-01 12:00:00.0 UTC</creationDate>
            <value>
              <version>11</version>
              <hash>9f2c</hash>
            </value>
          </jenkins.security.apitoken.ApiTokenStore_-HashedToken>
        </tokenList>
      </tokenStore>
    </jenkins.security.ApiTokenProperty>
    <hudson.model.MyViewsProperty>
      <views>
        <hudson.model.AllView>
          <name>all</name>
        </hudson.model.AllView>
      </views>
    </hudson.model.MyViewsProperty>
  </properties>
</user>
"#;

    #[test]
    fn maps_user_ids_to_directories() {
        let users = user_directories(USERS_XML).unwrap();
        assert_eq!(users.len(), 2);
        assert_eq!(users["admin"], "admin_8452935468239187");
    }

    #[test]
    fn finds_token_names_but_not_other_names() {
        assert_eq!(api_token_names(USER_CONFIG_XML).unwrap(), ["provisioner"]);

        let no_tokens = USER_CONFIG_XML.replace("provisioner", "other");
        assert_eq!(api_token_names(&no_tokens).unwrap(), ["other"]);
    }

    #[test]
    fn malformed_xml_is_an_error() {
        let truncated = "<hudson.model.UserIdMapper><entry>";
        assert!(user_directories(truncated).is_err());
    }
}
