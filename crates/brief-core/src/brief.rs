//! The three-stage meeting brief pipeline.

use crate::stage::{DefinitionError, Pipeline, StageScope, StageSpec};

pub const CALENDAR_STAGE: &str = "calendar";
pub const RESEARCH_STAGE: &str = "research";
pub const DOCUMENT_STAGE: &str = "document";

/// Template parameter naming the calendar to read meetings from.
pub const CALENDAR_ID_PARAMETER: &str = "calendar_id";
pub const DEFAULT_CALENDAR_ID: &str = "primary";

const CALENDAR_PROMPT: &str = "\
The current time is {now}.
Fetch the next 5 meetings from the Google Calendar with id {calendar_id}, starting from now.
For each meeting list the title, start and end time, description and every attendee with their name and email.
Answer with the meeting details only.";

const RESEARCH_PROMPT: &str = "\
These are my upcoming meetings:

{calendar}

For the first meeting with an external attendee, research the person I am meeting with and their company.
Use the Apollo and search tools for the person and the search tools for the company.
Answer with two sections:
- Person research (100 words)
- Company research (100 words)";

const DOCUMENT_PROMPT: &str = "\
Meeting details:

{calendar}

Research:

{research}

Write a meeting brief report in markdown with the sections Meeting details, Person research and Company research.
Create a Google Doc containing the report.
Then create a contact in HubSpot for the person. Non negotiable details: firstname, lastname, company, email; fill any extra details that are relevant.
You have full permission to use the tools and complete all the tasks.
Answer with the final report.";

/// Calendar retrieval, then person and company research under the shared
/// scope, then document authoring.
pub fn meeting_brief_pipeline() -> Result<Pipeline, DefinitionError> {
    Pipeline::new(
        vec![
            StageSpec::new(
                CALENDAR_STAGE,
                [
                    "GOOGLECALENDAR_FIND_EVENT",
                    "GOOGLECALENDAR_GET_CURRENT_DATE_TIME",
                    "GOOGLECALENDAR_GET_CALENDAR",
                ],
                CALENDAR_PROMPT,
                10,
            ),
            StageSpec::new(
                RESEARCH_STAGE,
                [
                    "COMPOSIO_SEARCH_SEARCH",
                    "COMPOSIO_SEARCH_TAVILY_SEARCH",
                    "APOLLO_PEOPLE_SEARCH",
                ],
                RESEARCH_PROMPT,
                15,
            )
            .with_scope(StageScope::Shared),
            StageSpec::new(
                DOCUMENT_STAGE,
                [
                    "GOOGLEDOCS_CREATE_DOCUMENT_MARKDOWN",
                    "HUBSPOT_CREATE_CONTACT_OBJECT_WITH_PROPERTIES",
                ],
                DOCUMENT_PROMPT,
                10,
            ),
        ],
        [CALENDAR_ID_PARAMETER],
    )
}
