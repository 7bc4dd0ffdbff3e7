//! Canonicalises spoken numerals in a final user transcript before it is
//! forwarded to Agent Core (§4.5): "one two three" becomes "123", while a
//! structured phrase like "one hundred and fifty" is disambiguated as the
//! single value 150 rather than the digits "1", "100", "50" read in
//! sequence.
//!
//! Only runs of two or more number words are rewritten; a lone number word
//! surrounded by ordinary prose ("can I get one moment") is left alone,
//! since a single word is too ambiguous to safely rewrite.

fn word_value(word: &str) -> Option<u64> {
    Some(match word {
        "zero" | "oh" => 0,
        "one" => 1,
        "two" => 2,
        "three" => 3,
        "four" => 4,
        "five" => 5,
        "six" => 6,
        "seven" => 7,
        "eight" => 8,
        "nine" => 9,
        "ten" => 10,
        "eleven" => 11,
        "twelve" => 12,
        "thirteen" => 13,
        "fourteen" => 14,
        "fifteen" => 15,
        "sixteen" => 16,
        "seventeen" => 17,
        "eighteen" => 18,
        "nineteen" => 19,
        "twenty" => 20,
        "thirty" => 30,
        "forty" => 40,
        "fifty" => 50,
        "sixty" => 60,
        "seventy" => 70,
        "eighty" => 80,
        "ninety" => 90,
        "hundred" => 100,
        "thousand" => 1000,
        _ => return None,
    })
}

fn strip_punct(word: &str) -> String {
    word.trim_matches(|c: char| !c.is_alphanumeric()).to_ascii_lowercase()
}

/// A single word's recognised role in a number run.
enum Tok {
    Digit(u64),
    Structural(u64),
    And,
}

fn classify(word: &str) -> Option<Tok> {
    if word.eq_ignore_ascii_case("and") {
        return Some(Tok::And);
    }
    let value = word_value(&strip_punct(word))?;
    if value >= 10 {
        Some(Tok::Structural(value))
    } else {
        Some(Tok::Digit(value))
    }
}

/// Aggregate a run of number words (e.g. `["one", "hundred", "and", "fifty"]`)
/// into its spoken value, provided at least one structural word (ten+) is
/// present. Returns `None` for a run of plain digit words, which must
/// instead be concatenated digit-by-digit.
fn aggregate(tokens: &[&str]) -> Option<u64> {
    let mut saw_structural = false;
    let mut total: u64 = 0;
    let mut current: u64 = 0;
    for tok in tokens {
        match classify(tok)? {
            Tok::And => continue,
            Tok::Digit(v) => current += v,
            Tok::Structural(100) => {
                saw_structural = true;
                current = if current == 0 { 1 } else { current } * 100;
            }
            Tok::Structural(1000) => {
                saw_structural = true;
                let multiplier = if current == 0 { 1 } else { current };
                total += multiplier * 1000;
                current = 0;
            }
            Tok::Structural(v) => {
                saw_structural = true;
                current += v;
            }
        }
    }
    saw_structural.then_some(total + current)
}

/// Concatenate a run of digit words one-for-one: "one two three" -> "123".
fn digit_concat(tokens: &[&str]) -> String {
    tokens
        .iter()
        .filter_map(|t| word_value(&strip_punct(t)))
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join("")
}

/// Canonicalise spoken numerals embedded in `text` (§4.5).
pub fn canonicalize_numerals(text: &str) -> String {
    let words: Vec<&str> = text.split_whitespace().collect();
    let mut out: Vec<String> = Vec::with_capacity(words.len());
    let mut i = 0;
    while i < words.len() {
        if classify(words[i]).is_some() {
            let start = i;
            let mut j = i + 1;
            while j < words.len() && classify(words[j]).is_some() {
                j += 1;
            }
            let run = &words[start..j];
            let number_word_count = run.iter().filter(|w| !w.eq_ignore_ascii_case("and")).count();
            if number_word_count >= 2 {
                if let Some(value) = aggregate(run) {
                    out.push(value.to_string());
                } else {
                    out.push(digit_concat(run));
                }
            } else {
                out.extend(run.iter().map(|s| s.to_string()));
            }
            i = j;
        } else {
            out.push(words[i].to_string());
            i += 1;
        }
    }
    out.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digit_sequence_is_concatenated() {
        assert_eq!(canonicalize_numerals("one two three"), "123");
    }

    #[test]
    fn structured_amount_is_disambiguated() {
        assert_eq!(canonicalize_numerals("one hundred and fifty"), "150");
    }

    #[test]
    fn lone_number_word_in_prose_is_untouched() {
        assert_eq!(canonicalize_numerals("can I get one moment"), "can I get one moment");
    }

    #[test]
    fn sort_code_dictation_round_trips() {
        assert_eq!(canonicalize_numerals("my sort code is one one two two three three"), "my sort code is 112233");
    }

    #[test]
    fn non_numeric_text_is_unchanged() {
        assert_eq!(canonicalize_numerals("hello there, how are you?"), "hello there, how are you?");
    }
}
