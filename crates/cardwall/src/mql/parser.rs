//! Recursive-descent parser for MQL.
//!
//! Precedence, lowest first: `OR`, `AND`, `NOT`, atoms. Binary operators
//! associate to the left.

use super::ast::{
    AggregateFunction, Condition, Direction, OrderBy, ParsedQuery, SelectColumn, Value,
};
use super::lexer::{Keyword, Lexer, Operator, Spanned, Token};
use crate::errors::MqlError;

pub struct Parser {
    tokens: Vec<Spanned>,
    position: usize,
    end: usize,
}

impl Parser {
    pub fn new(tokens: Vec<Spanned>, input_len: usize) -> Self {
        Parser {
            tokens,
            position: 0,
            end: input_len,
        }
    }

    /// Parse a complete MQL statement.
    pub fn parse_query(input: &str) -> Result<ParsedQuery, MqlError> {
        let mut parser = Parser::new(Lexer::tokenize(input)?, input.chars().count());
        let query = parser.query_body()?;
        parser.expect_end()?;
        Ok(query)
    }

    /// Parse a bare condition, as stored on aggregates (no `WHERE`).
    pub fn parse_condition(input: &str) -> Result<Condition, MqlError> {
        let mut parser = Parser::new(Lexer::tokenize(input)?, input.chars().count());
        parser.eat_keyword(Keyword::Where);
        let condition = parser.parse_or()?;
        parser.expect_end()?;
        Ok(condition)
    }

    fn query_body(&mut self) -> Result<ParsedQuery, MqlError> {
        let mut query = ParsedQuery::default();

        if self.eat_keyword(Keyword::Select) {
            query.distinct = self.eat_keyword(Keyword::Distinct);
            query.columns = self.comma_separated(Parser::parse_select_column)?;
        }
        if self.clause(Keyword::As, Keyword::Of)? {
            query.as_of = Some(self.parse_date_literal()?);
        }
        if self.clause(Keyword::From, Keyword::Tree)? {
            query.from_trees = self.comma_separated(Parser::parse_name)?;
        }
        if self.eat_keyword(Keyword::Where) {
            query.condition = Some(self.parse_or()?);
        }
        if self.clause(Keyword::Group, Keyword::By)? {
            query.group_by = self.comma_separated(Parser::parse_name)?;
        }
        if self.clause(Keyword::Order, Keyword::By)? {
            query.order_by = self.comma_separated(Parser::parse_order_by)?;
        }
        if self.clause(Keyword::As, Keyword::Of)? {
            if query.as_of.is_some() {
                return Err(self.error_previous("AS OF may only appear once"));
            }
            query.as_of = Some(self.parse_date_literal()?);
        }

        Ok(query)
    }

    /// Consume a two-word clause opener such as `GROUP BY`. A lone first
    /// word is a keyword used as a name and is reported as such.
    fn clause(&mut self, first: Keyword, second: Keyword) -> Result<bool, MqlError> {
        let Some(Spanned {
            token: Token::Keyword(keyword, text),
            position,
        }) = self.tokens.get(self.position)
        else {
            return Ok(false);
        };
        if *keyword != first {
            return Ok(false);
        }
        if matches!(self.peek_token_at(1), Some(Token::Keyword(k, _)) if *k == second) {
            self.position += 2;
            return Ok(true);
        }
        Err(MqlError::ReservedWord {
            word: text.clone(),
            keyword: keyword.as_str().to_string(),
            position: *position,
        })
    }

    fn parse_date_literal(&mut self) -> Result<String, MqlError> {
        match self.advance() {
            Some(Token::Quoted(text)) | Some(Token::Word(text)) | Some(Token::Number(text)) => {
                Ok(text)
            }
            Some(other) => Err(self.error_previous(format!(
                "expected a date after AS OF, found '{}'",
                other.describe()
            ))),
            None => Err(MqlError::UnexpectedEnd {
                expected: "a date after AS OF".to_string(),
            }),
        }
    }

    fn parse_select_column(&mut self) -> Result<SelectColumn, MqlError> {
        if let Some(Token::Keyword(keyword, text)) = self.peek_token() {
            let function = match keyword {
                Keyword::Count | Keyword::Sum | Keyword::Avg | Keyword::Min | Keyword::Max => {
                    AggregateFunction::parse(text)
                }
                _ => None,
            };
            if let Some(function) = function {
                if self.peek_token_at(1) == Some(&Token::LParen) {
                    self.advance();
                    self.advance();
                    let property = if self.peek_token() == Some(&Token::Star) {
                        self.advance();
                        None
                    } else {
                        Some(self.parse_name()?)
                    };
                    self.expect(Token::RParen, "')'")?;
                    if property.is_none() && function != AggregateFunction::Count {
                        return Err(self.error_previous(format!(
                            "{}(*) is not supported; name a numeric property",
                            function.as_str()
                        )));
                    }
                    return Ok(SelectColumn::Aggregate { function, property });
                }
            }
        }
        Ok(SelectColumn::Property(self.parse_name()?))
    }

    fn parse_order_by(&mut self) -> Result<OrderBy, MqlError> {
        let property = self.parse_name()?;
        let direction = if self.eat_keyword(Keyword::Desc) {
            Direction::Desc
        } else {
            self.eat_keyword(Keyword::Asc);
            Direction::Asc
        };
        Ok(OrderBy {
            property,
            direction,
        })
    }

    /// Parse OR expression (lowest precedence)
    fn parse_or(&mut self) -> Result<Condition, MqlError> {
        let mut left = self.parse_and()?;
        while self.eat_keyword(Keyword::Or) {
            let right = self.parse_and()?;
            left = left.or(right);
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Condition, MqlError> {
        let mut left = self.parse_not()?;
        while self.eat_keyword(Keyword::And) {
            let right = self.parse_not()?;
            left = left.and(right);
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Condition, MqlError> {
        if self.eat_keyword(Keyword::Not) {
            return Ok(self.parse_not()?.negate());
        }
        self.parse_atom()
    }

    fn parse_atom(&mut self) -> Result<Condition, MqlError> {
        match self.peek_token() {
            None => Err(MqlError::UnexpectedEnd {
                expected: "a condition".to_string(),
            }),
            Some(Token::LParen) => {
                self.advance();
                let inner = self.parse_or()?;
                self.expect(Token::RParen, "')'")?;
                Ok(inner)
            }
            Some(Token::Keyword(Keyword::Tagged, _)) => {
                self.advance();
                self.expect_keyword(Keyword::With)?;
                Ok(Condition::TaggedWith(self.parse_plain_value("a tag")?))
            }
            Some(Token::Keyword(Keyword::In, _))
                if matches!(self.peek_token_at(1), Some(Token::Keyword(Keyword::Plan, _))) =>
            {
                self.advance();
                self.advance();
                Ok(Condition::InPlan(self.parse_plain_value("a plan name")?))
            }
            Some(_) => {
                let property = self.parse_name()?;
                self.parse_comparison(property)
            }
        }
    }

    fn parse_comparison(&mut self, property: String) -> Result<Condition, MqlError> {
        match self.advance() {
            Some(Token::Operator(operator)) => {
                if self.eat_keyword(Keyword::Null) {
                    return match operator {
                        Operator::Eq => Ok(Condition::IsNull {
                            property,
                            negated: false,
                        }),
                        Operator::Ne => Ok(Condition::IsNull {
                            property,
                            negated: true,
                        }),
                        _ => Err(self.error_previous(format!(
                            "NULL cannot be compared with '{}'",
                            operator.as_str()
                        ))),
                    };
                }
                let value = self.parse_value()?;
                Ok(Condition::compare(property, operator, value))
            }
            Some(Token::Keyword(Keyword::Is, _)) => {
                let negated = self.eat_keyword(Keyword::Not);
                if self.eat_keyword(Keyword::Null) {
                    return Ok(Condition::IsNull { property, negated });
                }
                let operator = if negated { Operator::Ne } else { Operator::Eq };
                let value = self.parse_value()?;
                Ok(Condition::compare(property, operator, value))
            }
            Some(Token::Keyword(Keyword::In, _)) => self.parse_in(property, false),
            Some(Token::Keyword(Keyword::Not, _)) => {
                self.expect_keyword(Keyword::In)?;
                self.parse_in(property, true)
            }
            Some(Token::Keyword(Keyword::Numbers, _)) => {
                self.expect_keyword(Keyword::In)?;
                self.expect(Token::LParen, "'('")?;
                let numbers = self.comma_separated(|p| match p.advance() {
                    Some(Token::Number(n)) => Ok(n),
                    Some(other) => Err(p.error_previous(format!(
                        "NUMBERS IN expects card numbers, found '{}'",
                        other.describe()
                    ))),
                    None => Err(MqlError::UnexpectedEnd {
                        expected: "a card number".to_string(),
                    }),
                })?;
                self.expect(Token::RParen, "')'")?;
                Ok(Condition::NumbersIn { property, numbers })
            }
            Some(other) => Err(self.error_previous(format!(
                "expected an operator after '{}', found '{}'",
                property,
                other.describe()
            ))),
            None => Err(MqlError::UnexpectedEnd {
                expected: format!("an operator after '{}'", property),
            }),
        }
    }

    fn parse_in(&mut self, property: String, negated: bool) -> Result<Condition, MqlError> {
        self.expect(Token::LParen, "'('")?;
        if self.at_keyword(Keyword::Select) {
            let query = self.query_body()?;
            self.expect(Token::RParen, "')'")?;
            return Ok(Condition::InQuery {
                property,
                query: Box::new(query),
                negated,
            });
        }
        let values = self.comma_separated(Parser::parse_value)?;
        self.expect(Token::RParen, "')'")?;
        Ok(Condition::In {
            property,
            values,
            negated,
        })
    }

    fn parse_value(&mut self) -> Result<Value, MqlError> {
        let position = self.current_position();
        match self.advance() {
            Some(Token::Quoted(text)) | Some(Token::Word(text)) | Some(Token::Number(text)) => {
                Ok(Value::Literal(text))
            }
            Some(Token::LParen) => {
                let name = self.parse_name()?;
                self.expect(Token::RParen, "')' after the project variable name")?;
                Ok(Value::Variable(name))
            }
            Some(Token::Keyword(Keyword::This, _)) => {
                self.expect_keyword(Keyword::Card)?;
                if self.peek_token() == Some(&Token::Dot) {
                    self.advance();
                    Ok(Value::ThisCard(Some(self.parse_name()?)))
                } else {
                    Ok(Value::ThisCard(None))
                }
            }
            Some(Token::Keyword(Keyword::Today, _)) => Ok(Value::Today),
            Some(Token::Keyword(Keyword::Current, _)) => {
                self.expect_keyword(Keyword::User)?;
                Ok(Value::CurrentUser)
            }
            Some(Token::Keyword(Keyword::Number, _)) => match self.advance() {
                Some(Token::Number(number)) => Ok(Value::CardNumber(number)),
                _ => Err(self.error_previous("NUMBER must be followed by a card number")),
            },
            Some(Token::Keyword(Keyword::Property, _)) => {
                Ok(Value::Property(self.parse_name()?))
            }
            Some(Token::Keyword(keyword, text)) if keyword.is_soft() => Ok(Value::Literal(text)),
            Some(Token::Keyword(keyword, text)) => Err(MqlError::ReservedWord {
                word: text,
                keyword: keyword.as_str().to_string(),
                position,
            }),
            Some(other) => Err(MqlError::syntax(
                format!("expected a value, found '{}'", other.describe()),
                position,
            )),
            None => Err(MqlError::UnexpectedEnd {
                expected: "a value".to_string(),
            }),
        }
    }

    /// A literal-only value (tags and plan names).
    fn parse_plain_value(&mut self, what: &str) -> Result<String, MqlError> {
        match self.parse_value()? {
            Value::Literal(text) => Ok(text),
            other => Err(self.error_previous(format!("expected {}, found {}", what, other))),
        }
    }

    /// Property, tree or variable name.
    fn parse_name(&mut self) -> Result<String, MqlError> {
        let position = self.current_position();
        match self.advance() {
            Some(Token::Word(text)) | Some(Token::Quoted(text)) => Ok(text),
            Some(Token::Keyword(Keyword::Number, text)) => Ok(text),
            Some(Token::Keyword(keyword, text)) if keyword.is_soft() => Ok(text),
            Some(Token::Keyword(keyword, text)) => Err(MqlError::ReservedWord {
                word: text,
                keyword: keyword.as_str().to_string(),
                position,
            }),
            Some(other) => Err(MqlError::syntax(
                format!("expected a property name, found '{}'", other.describe()),
                position,
            )),
            None => Err(MqlError::UnexpectedEnd {
                expected: "a property name".to_string(),
            }),
        }
    }

    fn comma_separated<T>(
        &mut self,
        mut item: impl FnMut(&mut Parser) -> Result<T, MqlError>,
    ) -> Result<Vec<T>, MqlError> {
        let mut items = vec![item(self)?];
        while self.peek_token() == Some(&Token::Comma) {
            self.advance();
            items.push(item(self)?);
        }
        Ok(items)
    }

    fn expect_end(&self) -> Result<(), MqlError> {
        match self.tokens.get(self.position) {
            None => Ok(()),
            Some(Spanned {
                token: Token::Keyword(keyword, text),
                position,
            }) if !keyword.is_soft() && self.follows_name() => Err(MqlError::ReservedWord {
                word: text.clone(),
                keyword: keyword.as_str().to_string(),
                position: *position,
            }),
            Some(spanned) => Err(MqlError::syntax(
                format!("unexpected '{}'", spanned.token.describe()),
                spanned.position,
            )),
        }
    }

    /// Whether the previous token is a name, i.e. a keyword at this point
    /// most likely continues a multi-word name such as `Sort Order`.
    fn follows_name(&self) -> bool {
        self.position > 0
            && matches!(
                self.tokens[self.position - 1].token,
                Token::Word(_) | Token::Keyword(..)
            )
    }

    fn expect(&mut self, expected: Token, description: &str) -> Result<(), MqlError> {
        let position = self.current_position();
        match self.advance() {
            Some(token) if token == expected => Ok(()),
            Some(token) => Err(MqlError::syntax(
                format!("expected {}, found '{}'", description, token.describe()),
                position,
            )),
            None => Err(MqlError::UnexpectedEnd {
                expected: description.to_string(),
            }),
        }
    }

    fn expect_keyword(&mut self, keyword: Keyword) -> Result<(), MqlError> {
        if self.eat_keyword(keyword) {
            return Ok(());
        }
        match self.peek_token() {
            Some(token) => Err(self.error_here(format!(
                "expected {}, found '{}'",
                keyword.as_str(),
                token.describe()
            ))),
            None => Err(MqlError::UnexpectedEnd {
                expected: keyword.as_str().to_string(),
            }),
        }
    }

    fn eat_keyword(&mut self, keyword: Keyword) -> bool {
        if self.at_keyword(keyword) {
            self.position += 1;
            true
        } else {
            false
        }
    }

    fn at_keyword(&self, keyword: Keyword) -> bool {
        matches!(self.peek_token(), Some(Token::Keyword(k, _)) if *k == keyword)
    }

    fn peek_token(&self) -> Option<&Token> {
        self.peek_token_at(0)
    }

    fn peek_token_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.position + offset).map(|s| &s.token)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.position).map(|s| s.token.clone());
        if token.is_some() {
            self.position += 1;
        }
        token
    }

    fn current_position(&self) -> usize {
        self.tokens
            .get(self.position)
            .map_or(self.end, |s| s.position)
    }

    fn error_here(&self, message: impl Into<String>) -> MqlError {
        MqlError::syntax(message, self.current_position())
    }

    fn error_previous(&self, message: impl Into<String>) -> MqlError {
        let position = self
            .position
            .checked_sub(1)
            .and_then(|i| self.tokens.get(i))
            .map_or(self.end, |s| s.position);
        MqlError::syntax(message, position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn literal(text: &str) -> Value {
        Value::Literal(text.to_string())
    }

    #[test]
    fn test_parse_where_with_and() {
        let query = Parser::parse_query("WHERE Points > 3 AND Type = Story").unwrap();
        assert_eq!(
            query.condition,
            Some(
                Condition::compare("Points", Operator::Gt, literal("3"))
                    .and(Condition::compare("Type", Operator::Eq, literal("Story")))
            )
        );
        assert!(query.columns.is_empty());
    }

    #[test]
    fn test_and_binds_tighter_than_or() {
        let condition = Parser::parse_condition("a = 1 OR b = 2 AND c = 3").unwrap();
        assert_eq!(
            condition,
            Condition::compare("a", Operator::Eq, literal("1")).or(Condition::compare(
                "b",
                Operator::Eq,
                literal("2")
            )
            .and(Condition::compare("c", Operator::Eq, literal("3"))))
        );
    }

    #[test]
    fn test_parse_full_query() {
        let query = Parser::parse_query(
            "SELECT DISTINCT Release, SUM('Story Points') FROM TREE 'Release Tree' \
             WHERE Owner IS NOT NULL GROUP BY Release ORDER BY Release DESC, Number",
        )
        .unwrap();
        assert!(query.distinct);
        assert_eq!(query.columns.len(), 2);
        assert_eq!(
            query.columns[1],
            SelectColumn::Aggregate {
                function: AggregateFunction::Sum,
                property: Some("Story Points".to_string())
            }
        );
        assert_eq!(query.from_trees, vec!["Release Tree"]);
        assert_eq!(query.group_by, vec!["Release"]);
        assert_eq!(query.order_by[0].direction, Direction::Desc);
        assert_eq!(query.order_by[1].property, "Number");
    }

    #[test]
    fn test_parse_count_star_and_as_of() {
        let query = Parser::parse_query("SELECT COUNT(*) WHERE Type = Story AS OF '2024-01-05'").unwrap();
        assert_eq!(
            query.columns,
            vec![SelectColumn::Aggregate {
                function: AggregateFunction::Count,
                property: None
            }]
        );
        assert_eq!(query.as_of.as_deref(), Some("2024-01-05"));

        let early = Parser::parse_query("SELECT Name AS OF '2024-01-05' WHERE Type = Story").unwrap();
        assert_eq!(early.as_of.as_deref(), Some("2024-01-05"));
    }

    #[test]
    fn test_parse_special_values() {
        let condition = Parser::parse_condition(
            "Release = THIS CARD.Release AND Owner = CURRENT USER AND Due < TODAY \
             AND Parent = NUMBER 12 AND Estimate > PROPERTY Actual AND Iteration = (Current Iteration)",
        );
        assert!(condition.is_err(), "multi-word variable names need quotes");

        let condition = Parser::parse_condition(
            "Release = THIS CARD.Release AND Owner = CURRENT USER AND Due < TODAY \
             AND Parent = NUMBER 12 AND Estimate > PROPERTY Actual AND Iteration = ('Current Iteration')",
        )
        .unwrap();
        let text = condition.to_string();
        assert!(text.contains("THIS CARD.Release"));
        assert!(text.contains("CURRENT USER"));
        assert!(text.contains("NUMBER 12"));
        assert!(text.contains("PROPERTY Actual"));
        assert!(text.contains("('Current Iteration')"));
    }

    #[test]
    fn test_parse_in_lists_and_subqueries() {
        let condition = Parser::parse_condition("Status NOT IN (open, 'in progress')").unwrap();
        assert_eq!(
            condition,
            Condition::In {
                property: "Status".to_string(),
                values: vec![literal("open"), literal("in progress")],
                negated: true
            }
        );

        let condition =
            Parser::parse_condition("Release IN (SELECT Number WHERE Status = open)").unwrap();
        match condition {
            Condition::InQuery { query, negated, .. } => {
                assert!(!negated);
                assert_eq!(query.columns, vec![SelectColumn::Property("Number".to_string())]);
            }
            other => panic!("expected sub-query, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_numbers_in_tagged_and_plan() {
        let condition =
            Parser::parse_condition("Release NUMBERS IN (1, 2) AND NOT TAGGED WITH urgent AND IN PLAN 'Q1'")
                .unwrap();
        assert_eq!(
            condition.to_string(),
            "Release NUMBERS IN (1, 2) AND NOT TAGGED WITH urgent AND IN PLAN Q1"
        );
    }

    #[test]
    fn test_is_synonyms() {
        assert_eq!(
            Parser::parse_condition("Status IS open").unwrap(),
            Condition::compare("Status", Operator::Eq, literal("open"))
        );
        assert_eq!(
            Parser::parse_condition("Status IS NOT open").unwrap(),
            Condition::compare("Status", Operator::Ne, literal("open"))
        );
        assert_eq!(
            Parser::parse_condition("Status = NULL").unwrap(),
            Condition::IsNull {
                property: "Status".to_string(),
                negated: false
            }
        );
    }

    #[test]
    fn test_reserved_word_as_property_is_called_out() {
        let err = Parser::parse_query("WHERE Order = 1").unwrap_err();
        assert!(matches!(err, MqlError::ReservedWord { ref word, .. } if word == "Order"));

        let err = Parser::parse_query("SELECT Name, Sort Order").unwrap_err();
        assert!(matches!(err, MqlError::ReservedWord { ref keyword, .. } if keyword == "ORDER"));

        assert!(Parser::parse_query("WHERE 'Order' = 1").is_ok());
    }

    #[test]
    fn test_soft_keywords_name_properties() {
        let query = Parser::parse_query("SELECT User, Count WHERE Card = 4").unwrap();
        assert_eq!(
            query.columns,
            vec![
                SelectColumn::Property("User".to_string()),
                SelectColumn::Property("Count".to_string())
            ]
        );
    }

    #[test]
    fn test_errors_carry_positions() {
        assert_eq!(
            Parser::parse_query("WHERE Status open").unwrap_err(),
            MqlError::syntax("expected an operator after 'Status', found 'open'", 13)
        );
        assert!(matches!(
            Parser::parse_query("WHERE Status =").unwrap_err(),
            MqlError::UnexpectedEnd { .. }
        ));
        assert!(matches!(
            Parser::parse_query("WHERE (a = 1").unwrap_err(),
            MqlError::UnexpectedEnd { .. }
        ));
    }

    #[test]
    fn test_empty_input_is_empty_query() {
        assert_eq!(Parser::parse_query("").unwrap(), ParsedQuery::default());
    }
}
